use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use jobsched_domain::{
    Clock, ExecutionRepository, Job, JobRepository, JobSchedule, JobStatus, RejectReason,
    Schedule, ScheduleRepository,
};
use jobsched_errors::{SchedulerError, SchedulerResult};
use jobsched_infrastructure::{MetricsCollector, StructuredLogger};

use crate::cron_utils::CronScheduler;
use crate::lifecycle::ExecutionController;

/// 调度关联管理
pub struct SchedulingService {
    jobs: Arc<dyn JobRepository>,
    schedules: Arc<dyn ScheduleRepository>,
    executions: Arc<dyn ExecutionRepository>,
    controller: Arc<ExecutionController>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
}

impl SchedulingService {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        schedules: Arc<dyn ScheduleRepository>,
        executions: Arc<dyn ExecutionRepository>,
        controller: Arc<ExecutionController>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            jobs,
            schedules,
            executions,
            controller,
            clock,
            metrics,
        }
    }

    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        CronScheduler::validate_cron_expression(cron_expr)
    }

    /// 校验CRON表达式与时区后保存调度
    pub async fn create_schedule(&self, schedule: &Schedule) -> SchedulerResult<Schedule> {
        CronScheduler::new(&schedule.cron_expression, &schedule.timezone)?;
        self.schedules.create_schedule(schedule).await
    }

    /// 关联任务与调度；关联已存在时返回 `Rejected(duplicate schedule link)`
    #[instrument(skip(self))]
    pub async fn schedule_job(&self, job_id: i64, schedule_id: i64) -> SchedulerResult<JobSchedule> {
        if self.jobs.get_job(job_id).await?.is_none() {
            return Err(SchedulerError::job_not_found(job_id));
        }
        let schedule = self
            .schedules
            .get_schedule(schedule_id)
            .await?
            .ok_or(SchedulerError::ScheduleNotFound { id: schedule_id })?;
        CronScheduler::new(&schedule.cron_expression, &schedule.timezone)?;

        match self.schedules.link(job_id, schedule_id).await {
            Ok(link) => {
                info!("任务 {} 已关联调度 {}", job_id, schedule_id);
                Ok(link)
            }
            Err(SchedulerError::DuplicateScheduleLink { .. }) => {
                let reason = RejectReason::DuplicateScheduleLink { schedule_id };
                StructuredLogger::log_execution_rejected(job_id, reason.code(), &reason.to_string());
                self.metrics.record_rejected(reason.code());
                Err(SchedulerError::rejected(job_id, reason))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn unschedule_job(&self, job_id: i64, schedule_id: i64) -> SchedulerResult<bool> {
        let removed = self.schedules.unlink(job_id, schedule_id).await?;
        if removed {
            info!("任务 {} 已取消关联调度 {}", job_id, schedule_id);
        }
        Ok(removed)
    }

    /// 停用任务的全部调度关联
    pub async fn pause_job(&self, job_id: i64) -> SchedulerResult<u64> {
        let affected = self.schedules.set_links_active(job_id, false).await?;
        info!("任务 {} 已暂停，停用 {} 个调度关联", job_id, affected);
        Ok(affected)
    }

    pub async fn resume_job(&self, job_id: i64) -> SchedulerResult<u64> {
        let affected = self.schedules.set_links_active(job_id, true).await?;
        info!("任务 {} 已恢复，启用 {} 个调度关联", job_id, affected);
        Ok(affected)
    }

    /// 启用任务并恢复其全部调度关联；任务不存在时返回 false
    #[instrument(skip(self))]
    pub async fn activate_job(&self, job_id: i64) -> SchedulerResult<bool> {
        if !self.jobs.set_status(job_id, JobStatus::Active).await? {
            return Ok(false);
        }
        self.resume_job(job_id).await?;
        info!("任务 {} 已启用", job_id);
        Ok(true)
    }

    /// 停用任务并暂停其全部调度关联；已准入的执行不受影响
    #[instrument(skip(self))]
    pub async fn deactivate_job(&self, job_id: i64) -> SchedulerResult<bool> {
        if !self.jobs.set_status(job_id, JobStatus::Inactive).await? {
            return Ok(false);
        }
        self.pause_job(job_id).await?;
        info!("任务 {} 已停用", job_id);
        Ok(true)
    }

    /// 至少有一个激活关联的任务，按创建时间倒序
    pub async fn scheduled_jobs(&self) -> SchedulerResult<Vec<Job>> {
        let mut scheduled = Vec::new();
        for job in self.jobs.list_jobs().await? {
            let links = self.schedules.links_for_job(job.id).await?;
            if links.iter().any(|link| link.is_active) {
                scheduled.push(job);
            }
        }
        newest_first(&mut scheduled);
        Ok(scheduled)
    }

    /// 没有任何调度关联的任务，按创建时间倒序
    pub async fn unscheduled_jobs(&self) -> SchedulerResult<Vec<Job>> {
        let mut unscheduled = Vec::new();
        for job in self.jobs.list_jobs().await? {
            if self.schedules.links_for_job(job.id).await?.is_empty() {
                unscheduled.push(job);
            }
        }
        newest_first(&mut unscheduled);
        Ok(unscheduled)
    }

    /// 存在至少一个激活关联且对应调度也处于激活状态
    pub async fn is_job_scheduled(&self, job_id: i64) -> SchedulerResult<bool> {
        Ok(!self.active_schedules(job_id).await?.is_empty())
    }

    /// 所有激活调度中最早的下一次触发时间
    pub async fn next_execution_time(&self, job_id: i64) -> SchedulerResult<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        Ok(self
            .active_schedulers(job_id)
            .await?
            .iter()
            .filter_map(|scheduler| scheduler.next_after(now))
            .min())
    }

    /// 所有激活调度中最近的上一次触发时间
    pub async fn previous_execution_time(
        &self,
        job_id: i64,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        Ok(self
            .active_schedulers(job_id)
            .await?
            .iter()
            .filter_map(|scheduler| scheduler.previous_before(now))
            .max())
    }

    /// 取消任务的全部未结束执行，返回实际取消的数量
    pub async fn cancel_job_executions(&self, job_id: i64) -> SchedulerResult<usize> {
        let mut cancelled = 0;
        for execution in self.executions.find_non_terminal(job_id).await? {
            match self.controller.cancel(execution.execution_id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => warn!("取消执行实例 {} 失败: {}", execution.execution_id, e),
            }
        }
        info!("任务 {} 共取消 {} 个执行", job_id, cancelled);
        Ok(cancelled)
    }

    async fn active_schedules(&self, job_id: i64) -> SchedulerResult<Vec<Schedule>> {
        let mut schedules = Vec::new();
        for link in self.schedules.links_for_job(job_id).await? {
            if !link.is_active {
                continue;
            }
            if let Some(schedule) = self.schedules.get_schedule(link.schedule_id).await? {
                if schedule.is_active {
                    schedules.push(schedule);
                }
            }
        }
        Ok(schedules)
    }

    async fn active_schedulers(&self, job_id: i64) -> SchedulerResult<Vec<CronScheduler>> {
        let mut schedulers = Vec::new();
        for schedule in self.active_schedules(job_id).await? {
            match CronScheduler::new(&schedule.cron_expression, &schedule.timezone) {
                Ok(scheduler) => schedulers.push(scheduler),
                Err(e) => warn!("调度 {} 的定义无效: {}", schedule.id, e),
            }
        }
        Ok(schedulers)
    }
}

fn newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}
