//! 执行生命周期控制
//!
//! 状态机 `PENDING → RUNNING → {COMPLETED | FAILED}`，`CANCELLED` 可由 `PENDING`
//! 或 `RUNNING` 进入。终态写入一律通过存储层的条件更新完成，因此
//! complete / fail / cancel 对同一次执行只有一个生效。进入过 RUNNING 的执行
//! 在每条退出路径上都会释放执行锁。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use jobsched_config::{ContentionPolicy, EngineConfig};
use jobsched_domain::{
    Clock, Execution, ExecutionPhase, ExecutionRepository, ExecutionStatus, Job, JobRepository,
    NotificationDispatcher, RejectReason, Repositories, RunContext,
};
use jobsched_errors::{SchedulerError, SchedulerResult};
use jobsched_infrastructure::{MetricsCollector, StructuredLogger};

use crate::dependency_resolver::DependencyResolver;
use crate::lock_manager::LockManager;
use crate::runners::RunnerRegistry;
use crate::statistics::StatisticsAggregator;

/// 锁竞争最终失败时记录的错误信息
pub const CONTENTION_MESSAGE: &str = "concurrent execution in progress";

/// 执行失去持有者（进程退出、锁丢失）后被恢复时记录的错误信息
pub const HOLDER_LOST_MESSAGE: &str = "execution holder lost";

const CANCEL_REQUESTED: &str = "cancelled by request";

#[derive(Debug)]
pub enum StartOutcome {
    Started(Execution),
    LockContended,
    /// 执行已不处于 PENDING，通常是在等待期间被取消
    NotPending,
}

pub struct ExecutionController {
    jobs: Arc<dyn JobRepository>,
    executions: Arc<dyn ExecutionRepository>,
    resolver: Arc<DependencyResolver>,
    locks: Arc<LockManager>,
    statistics: Arc<StatisticsAggregator>,
    runners: Arc<RunnerRegistry>,
    notifier: Option<Arc<dyn NotificationDispatcher>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
    active: RwLock<HashMap<Uuid, CancellationToken>>,
}

impl ExecutionController {
    pub fn new(
        repositories: &Repositories,
        runners: RunnerRegistry,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
        config: EngineConfig,
    ) -> Self {
        let resolver = Arc::new(DependencyResolver::new(
            repositories.jobs.clone(),
            repositories.dependencies.clone(),
            repositories.executions.clone(),
            clock.clone(),
            config.freshness_window(),
        ));
        let locks = Arc::new(LockManager::new(
            repositories.locks.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let statistics = Arc::new(StatisticsAggregator::new(
            repositories.statistics.clone(),
            repositories.executions.clone(),
        ));

        Self {
            jobs: repositories.jobs.clone(),
            executions: repositories.executions.clone(),
            resolver,
            locks,
            statistics,
            runners: Arc::new(runners),
            notifier: None,
            clock,
            metrics,
            permits: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            config,
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn statistics(&self) -> &Arc<StatisticsAggregator> {
        &self.statistics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 准入并在工作池中异步执行，返回执行ID
    pub async fn submit(
        self: &Arc<Self>,
        job_id: i64,
        parameters: serde_json::Value,
        schedule_id: Option<i64>,
    ) -> SchedulerResult<Uuid> {
        let (job, execution) = self.admit(job_id, parameters, schedule_id).await?;
        let execution_id = execution.execution_id;

        let token = CancellationToken::new();
        {
            let mut active = self.active.write().await;
            active.insert(execution_id, token.clone());
            self.metrics.set_running_executions(active.len());
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.drive(job, execution, token).await;
        });

        Ok(execution_id)
    }

    /// 准入检查：任务存在且处于活跃状态，阻塞型依赖全部满足
    ///
    /// 通过后创建 PENDING 记录；拒绝时不落任何记录。
    #[instrument(skip(self, parameters))]
    pub async fn admit(
        &self,
        job_id: i64,
        parameters: serde_json::Value,
        schedule_id: Option<i64>,
    ) -> SchedulerResult<(Job, Execution)> {
        let job = self
            .jobs
            .get_job(job_id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job_id))?;

        if !job.is_active() {
            return Err(self.reject(job_id, RejectReason::JobInactive));
        }

        let check = self.resolver.can_run(job_id).await;
        if let Some(reason) = check.reject_reason() {
            return Err(self.reject(job_id, reason));
        }

        let execution = Execution::new(
            job_id,
            schedule_id,
            job.merge_parameters(&parameters),
            self.clock.now(),
        );
        if let Err(e) = self.executions.create(&execution).await {
            return Err(self.storage_failure(ExecutionPhase::Admission, &execution, &e));
        }

        StructuredLogger::log_execution_admitted(job_id, execution.execution_id, schedule_id);
        self.metrics.record_admitted();
        Ok((job, execution))
    }

    /// 以执行ID为持有者获取执行锁并进入 RUNNING
    #[instrument(skip(self, job, execution), fields(job.id = job.id, execution.id = %execution.execution_id))]
    pub async fn start(&self, job: &Job, execution: &Execution) -> SchedulerResult<StartOutcome> {
        let holder = execution.execution_id.to_string();
        let ttl = self.config.lock_ttl_for(job.timeout_seconds);

        let acquired = self
            .locks
            .try_acquire(job.id, &holder, ttl)
            .await
            .map_err(|e| self.storage_failure(ExecutionPhase::LockAcquisition, execution, &e))?;
        if !acquired {
            return Ok(StartOutcome::LockContended);
        }

        let mut running = execution.clone();
        running.status = ExecutionStatus::Running;
        running.started_at = Some(self.clock.now());

        match self
            .executions
            .update_if_status(&running, ExecutionStatus::Running.allowed_sources())
            .await
        {
            Ok(true) => {
                StructuredLogger::log_execution_started(job.id, running.execution_id, &job.job_type);
                Ok(StartOutcome::Started(running))
            }
            Ok(false) => {
                debug!("执行实例 {} 已不处于 PENDING，放弃启动", execution.execution_id);
                self.release_lock(execution, ExecutionPhase::Start).await;
                Ok(StartOutcome::NotPending)
            }
            Err(e) => {
                self.release_lock(execution, ExecutionPhase::Start).await;
                Err(self.storage_failure(ExecutionPhase::Start, execution, &e))
            }
        }
    }

    /// RUNNING → COMPLETED
    pub async fn complete(
        &self,
        execution: &Execution,
        result: serde_json::Value,
    ) -> SchedulerResult<bool> {
        let mut done = execution.clone();
        done.finish(ExecutionStatus::Completed, self.clock.now());
        done.result = Some(result);
        self.finish(
            done,
            ExecutionStatus::Completed.allowed_sources(),
            ExecutionPhase::Completion,
            true,
        )
        .await
    }

    /// RUNNING（或前置条件失败时的 PENDING）→ FAILED
    pub async fn fail(
        &self,
        execution: &Execution,
        message: &str,
        detail: Option<String>,
    ) -> SchedulerResult<bool> {
        let mut done = execution.clone();
        done.finish(ExecutionStatus::Failed, self.clock.now());
        done.error_message = Some(message.to_string());
        done.error_detail = detail;
        self.finish(
            done,
            ExecutionStatus::Failed.allowed_sources(),
            ExecutionPhase::Failure,
            true,
        )
        .await
    }

    /// 将失去持有者的执行标记为 FAILED
    ///
    /// 仅当执行仍处于读取时的状态才写入，执行在此期间自行结束时返回 false。
    #[instrument(skip(self, execution), fields(job.id = execution.job_id, execution.id = %execution.execution_id))]
    pub async fn fail_orphaned(&self, execution: &Execution, detail: String) -> SchedulerResult<bool> {
        let mut done = execution.clone();
        done.finish(ExecutionStatus::Failed, self.clock.now());
        done.error_message = Some(HOLDER_LOST_MESSAGE.to_string());
        done.error_detail = Some(detail);

        let failed = self
            .finish(done, &[execution.status], ExecutionPhase::Run, false)
            .await?;
        if failed {
            self.metrics.record_recovered();
            self.signal(execution.execution_id).await;
        }
        Ok(failed)
    }

    /// 取消执行；执行已处于终态时返回 false
    pub async fn cancel(&self, execution_id: Uuid) -> SchedulerResult<bool> {
        self.cancel_with_reason(execution_id, CANCEL_REQUESTED).await
    }

    #[instrument(skip(self))]
    pub async fn cancel_with_reason(&self, execution_id: Uuid, reason: &str) -> SchedulerResult<bool> {
        loop {
            let current = self
                .executions
                .get(execution_id)
                .await?
                .ok_or_else(|| SchedulerError::execution_not_found(execution_id))?;
            if current.is_terminal() {
                debug!("执行实例 {} 已处于终态 {}，忽略取消", execution_id, current.status);
                return Ok(false);
            }

            let expected = [current.status];
            let mut done = current.clone();
            done.finish(ExecutionStatus::Cancelled, self.clock.now());
            done.error_message = Some(reason.to_string());

            // 读到的状态在写入前被推进时重新读取
            if self
                .finish(done, &expected, ExecutionPhase::Cancellation, false)
                .await?
            {
                self.signal(execution_id).await;
                return Ok(true);
            }
        }
    }

    /// 等待执行进入终态
    pub async fn wait_for_terminal(
        &self,
        execution_id: Uuid,
        timeout: Duration,
    ) -> SchedulerResult<Execution> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(execution) = self.executions.get(execution_id).await? {
                if execution.is_terminal() {
                    return Ok(execution);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SchedulerError::ExecutionTimeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// 本实例上尚未结束的执行数（含等待工作池与重新入队中的）
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn is_active(&self, execution_id: Uuid) -> bool {
        self.active.read().await.contains_key(&execution_id)
    }

    /// 取消本实例上全部执行，并在宽限期内等待其退出
    pub async fn shutdown(&self, grace: Duration) {
        let ids: Vec<Uuid> = self.active.read().await.keys().copied().collect();
        info!("关闭执行控制器，取消 {} 个执行", ids.len());
        for id in ids {
            if let Err(e) = self.cancel_with_reason(id, "engine shutdown").await {
                warn!("关闭时取消执行实例 {} 失败: {}", id, e);
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while self.active_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn drive(self: Arc<Self>, job: Job, execution: Execution, token: CancellationToken) {
        let execution_id = execution.execution_id;

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };

        if let Some(_permit) = permit {
            self.run_admitted(&job, &execution, &token).await;
        } else if !token.is_cancelled() {
            self.fail_logged(&execution, "工作池已关闭", None).await;
        }

        let mut active = self.active.write().await;
        active.remove(&execution_id);
        self.metrics.set_running_executions(active.len());
    }

    async fn run_admitted(&self, job: &Job, execution: &Execution, token: &CancellationToken) {
        let runner = match self.runners.get(&job.job_type) {
            Ok(runner) => runner,
            Err(e) => {
                self.fail_logged(execution, &e.to_string(), None).await;
                return;
            }
        };

        let Some(running) = self.start_with_policy(job, execution, token).await else {
            return;
        };

        let ctx = RunContext {
            execution_id: running.execution_id,
            job: job.clone(),
            parameters: running.parameters.clone(),
            cancellation: token.child_token(),
        };
        let timeout = self.config.effective_timeout(job.timeout_seconds);

        // 执行器在独立任务中运行，panic 以 JoinError 的形式返回
        let mut handle = tokio::spawn(async move { runner.run(ctx).await });

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("执行实例 {} 已取消，不再等待执行器", running.execution_id);
            }
            joined = &mut handle => match joined {
                Ok(Ok(value)) => {
                    if let Err(e) = self.complete(&running, value).await {
                        error!("记录执行实例 {} 完成失败: {}", running.execution_id, e);
                    }
                }
                Ok(Err(e)) => {
                    self.fail_logged(&running, &e.to_string(), None).await;
                }
                Err(join_error) => {
                    let message = if join_error.is_panic() {
                        format!("执行器异常退出: {}", panic_message(join_error.into_panic()))
                    } else {
                        "执行器任务被中止".to_string()
                    };
                    self.fail_logged(&running, &message, None).await;
                }
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    "执行实例 {} 超过 {} 秒未结束，按取消处理",
                    running.execution_id,
                    timeout.as_secs()
                );
                let reason = format!("执行超时 ({}秒)", timeout.as_secs());
                if let Err(e) = self.cancel_with_reason(running.execution_id, &reason).await {
                    error!("超时取消执行实例 {} 失败: {}", running.execution_id, e);
                }
            }
        }

        self.ensure_released(&running).await;
    }

    /// 按竞争策略获取锁并启动；返回 None 表示本次执行已结束或被放弃
    async fn start_with_policy(
        &self,
        job: &Job,
        execution: &Execution,
        token: &CancellationToken,
    ) -> Option<Execution> {
        let mut attempt: u32 = 0;
        loop {
            match self.start(job, execution).await {
                Ok(StartOutcome::Started(running)) => return Some(running),
                Ok(StartOutcome::NotPending) => return None,
                Ok(StartOutcome::LockContended) => {
                    let requeue = self.config.contention_policy == ContentionPolicy::RequeueThenFail
                        && attempt < self.config.max_requeue_attempts;
                    StructuredLogger::log_lock_contention(
                        job.id,
                        execution.execution_id,
                        attempt + 1,
                        requeue,
                    );

                    if !requeue {
                        let contention = SchedulerError::LockContention {
                            job_id: job.id,
                            execution_id: execution.execution_id.to_string(),
                        };
                        self.fail_logged(execution, CONTENTION_MESSAGE, Some(contention.to_string()))
                            .await;
                        return None;
                    }

                    attempt += 1;
                    let delay = self.requeue_delay();
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.fail_logged(execution, "执行启动失败", Some(e.to_string())).await;
                    return None;
                }
            }
        }
    }

    fn requeue_delay(&self) -> Duration {
        let base = self.config.requeue_delay_ms;
        let jitter = if base > 1 {
            rand::rng().random_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// 条件写入终态；写入生效后释放锁并执行统计与通知
    ///
    /// `owns_lock` 为 true 时调用方是执行本身，写入失败也会释放锁。
    async fn finish(
        &self,
        done: Execution,
        expected: &[ExecutionStatus],
        phase: ExecutionPhase,
        owns_lock: bool,
    ) -> SchedulerResult<bool> {
        match self.executions.update_if_status(&done, expected).await {
            Ok(true) => {
                self.release_lock(&done, phase).await;
                self.after_terminal(&done, phase).await;
                Ok(true)
            }
            Ok(false) => {
                debug!(
                    "执行实例 {} 的状态已变化，{} 未生效",
                    done.execution_id, done.status
                );
                Ok(false)
            }
            Err(e) => {
                if owns_lock {
                    self.release_lock(&done, phase).await;
                }
                Err(self.storage_failure(phase, &done, &e))
            }
        }
    }

    async fn after_terminal(&self, execution: &Execution, phase: ExecutionPhase) {
        match execution.status {
            ExecutionStatus::Completed => {
                self.metrics.record_completed(execution.duration_ms);
                StructuredLogger::log_execution_completed(
                    execution.job_id,
                    execution.execution_id,
                    execution.duration_ms,
                );
            }
            ExecutionStatus::Failed => {
                self.metrics.record_failed(execution.duration_ms);
                StructuredLogger::log_execution_failed(
                    execution.job_id,
                    execution.execution_id,
                    phase,
                    execution.error_message.as_deref().unwrap_or_default(),
                );
            }
            ExecutionStatus::Cancelled => {
                self.metrics.record_cancelled();
                StructuredLogger::log_execution_cancelled(
                    execution.job_id,
                    execution.execution_id,
                    execution.error_message.as_deref().unwrap_or_default(),
                );
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => return,
        }

        if matches!(
            execution.status,
            ExecutionStatus::Completed | ExecutionStatus::Failed
        ) {
            if let Err(e) = self.statistics.record_execution(execution).await {
                self.log_storage_failure(ExecutionPhase::Statistics, execution, &e);
            }
        }

        self.notify(execution);
    }

    fn notify(&self, execution: &Execution) {
        if !self.config.notification_enabled {
            return;
        }
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let execution = execution.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&execution, execution.status).await {
                warn!(
                    "执行实例 {} 的终态通知发送失败: {}",
                    execution.execution_id, e
                );
            }
        });
    }

    async fn fail_logged(&self, execution: &Execution, message: &str, detail: Option<String>) {
        if let Err(e) = self.fail(execution, message, detail).await {
            error!("记录执行实例 {} 失败状态时出错: {}", execution.execution_id, e);
        }
    }

    async fn signal(&self, execution_id: Uuid) {
        if let Some(token) = self.active.read().await.get(&execution_id) {
            token.cancel();
        }
    }

    async fn release_lock(&self, execution: &Execution, phase: ExecutionPhase) {
        let holder = execution.execution_id.to_string();
        if let Err(e) = self.locks.release(execution.job_id, &holder).await {
            // 释放失败时锁在租期结束后失效
            self.log_storage_failure(phase, execution, &e);
        }
    }

    /// 兜底：锁仍由本执行持有时释放
    async fn ensure_released(&self, execution: &Execution) {
        let holder = execution.execution_id.to_string();
        match self.locks.current(execution.job_id).await {
            Ok(Some(lock)) if lock.lock_holder == holder => {
                warn!("执行实例 {} 退出时仍持有锁，强制释放", execution.execution_id);
                self.release_lock(execution, ExecutionPhase::Run).await;
            }
            Ok(_) => {}
            Err(e) => self.log_storage_failure(ExecutionPhase::Run, execution, &e),
        }
    }

    fn reject(&self, job_id: i64, reason: RejectReason) -> SchedulerError {
        StructuredLogger::log_execution_rejected(job_id, reason.code(), &reason.to_string());
        self.metrics.record_rejected(reason.code());
        SchedulerError::rejected(job_id, reason)
    }

    fn log_storage_failure(&self, phase: ExecutionPhase, execution: &Execution, cause: &SchedulerError) {
        StructuredLogger::log_storage_failure(execution.job_id, execution.execution_id, phase, cause);
        self.metrics.record_storage_failure();
    }

    /// 记录存储失败并转换为带阶段信息的错误
    fn storage_failure(
        &self,
        phase: ExecutionPhase,
        execution: &Execution,
        cause: &SchedulerError,
    ) -> SchedulerError {
        self.log_storage_failure(phase, execution, cause);
        SchedulerError::storage_failure(phase, execution.job_id, execution.execution_id, cause)
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
