use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use jobsched_config::EngineConfig;
use jobsched_domain::{
    Clock, Execution, ExecutionStatus, JobExecutionSummary, JobRunner, NotificationDispatcher,
    Repositories, SystemClock,
};
use jobsched_errors::{SchedulerError, SchedulerResult};
use jobsched_infrastructure::MetricsCollector;

use crate::dependency_resolver::DependencyResolver;
use crate::lifecycle::ExecutionController;
use crate::lock_manager::LockManager;
use crate::recovery::{RecoveryReport, RecoveryService};
use crate::runners::RunnerRegistry;
use crate::scheduling::SchedulingService;
use crate::statistics::StatisticsAggregator;
use crate::trigger::TriggerSignal;

/// 健康判定使用的最近执行条数
pub const HEALTH_SAMPLE_SIZE: i64 = 7;

/// 执行核心的对外入口
pub struct JobEngine {
    repositories: Repositories,
    controller: Arc<ExecutionController>,
    scheduling: SchedulingService,
    recovery: Arc<RecoveryService>,
}

impl JobEngine {
    pub fn builder(repositories: Repositories, config: EngineConfig) -> JobEngineBuilder {
        JobEngineBuilder::new(repositories, config)
    }

    /// 手动或调度触发一次执行，准入通过后返回执行ID
    #[instrument(skip(self, parameters))]
    pub async fn trigger_job(
        &self,
        job_id: i64,
        parameters: serde_json::Value,
        schedule_id: Option<i64>,
    ) -> SchedulerResult<Uuid> {
        self.controller.submit(job_id, parameters, schedule_id).await
    }

    /// 取消执行；已处于终态时返回 false
    pub async fn cancel_execution(&self, execution_id: Uuid) -> SchedulerResult<bool> {
        self.controller.cancel(execution_id).await
    }

    pub async fn get_execution_status(&self, execution_id: Uuid) -> SchedulerResult<Execution> {
        self.repositories
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| SchedulerError::execution_not_found(execution_id))
    }

    pub async fn wait_for_execution(
        &self,
        execution_id: Uuid,
        timeout: Duration,
    ) -> SchedulerResult<Execution> {
        self.controller.wait_for_terminal(execution_id, timeout).await
    }

    pub async fn executions_for_job(&self, job_id: i64, limit: i64) -> SchedulerResult<Vec<Execution>> {
        self.repositories.executions.find_by_job(job_id, limit).await
    }

    pub async fn executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> SchedulerResult<Vec<Execution>> {
        self.repositories.executions.find_by_status(status).await
    }

    pub async fn recent_executions(&self, limit: i64) -> SchedulerResult<Vec<Execution>> {
        self.repositories.executions.find_recent(limit).await
    }

    pub async fn job_summary(&self, job_id: i64) -> SchedulerResult<JobExecutionSummary> {
        self.repositories.executions.summary(job_id).await
    }

    /// 最近 7 次执行中失败占比低于一半时视为健康；没有执行记录也视为健康
    pub async fn is_job_healthy(&self, job_id: i64) -> SchedulerResult<bool> {
        let recent = self
            .repositories
            .executions
            .find_by_job(job_id, HEALTH_SAMPLE_SIZE)
            .await?;
        if recent.is_empty() {
            return Ok(true);
        }

        let failed = recent
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failed)
            .count();
        Ok(failed * 2 < recent.len())
    }

    /// 将失去持有者的 RUNNING / PENDING 执行标记为 FAILED
    pub async fn recover_orphaned_executions(&self) -> SchedulerResult<RecoveryReport> {
        self.recovery.recover_orphaned_executions().await
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    pub fn controller(&self) -> &Arc<ExecutionController> {
        &self.controller
    }

    pub fn scheduling(&self) -> &SchedulingService {
        &self.scheduling
    }

    pub fn recovery(&self) -> &Arc<RecoveryService> {
        &self.recovery
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        self.controller.resolver()
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        self.controller.lock_manager()
    }

    pub fn statistics(&self) -> &Arc<StatisticsAggregator> {
        self.controller.statistics()
    }

    /// 消费触发信号并逐个提交；被拒绝的触发只记录日志
    pub async fn run_dispatch_loop(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<TriggerSignal>,
        shutdown: CancellationToken,
    ) {
        info!("启动触发分发循环");
        loop {
            let signal = tokio::select! {
                _ = shutdown.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => signal,
                    None => break,
                },
            };

            match self
                .trigger_job(signal.job_id, serde_json::json!({}), Some(signal.schedule_id))
                .await
            {
                Ok(execution_id) => debug!(
                    "调度触发已提交: job_id={}, schedule_id={}, execution_id={}",
                    signal.job_id, signal.schedule_id, execution_id
                ),
                // 拒绝原因已在准入时以 warn 级别记录
                Err(SchedulerError::Rejected { reason, .. }) => debug!(
                    "调度触发被拒绝: job_id={}, schedule_id={}, reason={}",
                    signal.job_id,
                    signal.schedule_id,
                    reason.code()
                ),
                Err(e) => error!("调度触发任务 {} 失败: {}", signal.job_id, e),
            }
        }
        info!("触发分发循环已退出");
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.controller.shutdown(grace).await;
    }
}

pub struct JobEngineBuilder {
    repositories: Repositories,
    config: EngineConfig,
    runners: RunnerRegistry,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<MetricsCollector>>,
    notifier: Option<Arc<dyn NotificationDispatcher>>,
}

impl JobEngineBuilder {
    pub fn new(repositories: Repositories, config: EngineConfig) -> Self {
        Self {
            repositories,
            config,
            runners: RunnerRegistry::new(),
            clock: Arc::new(SystemClock),
            metrics: None,
            notifier: None,
        }
    }

    pub fn with_runners(mut self, runners: RunnerRegistry) -> Self {
        self.runners = runners;
        self
    }

    pub fn with_runner(mut self, job_type: &str, runner: Arc<dyn JobRunner>) -> Self {
        self.runners.register(job_type, runner);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Arc<JobEngine> {
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsCollector::new()));

        let pending_grace = self.config.orphan_pending_after();
        let mut controller = ExecutionController::new(
            &self.repositories,
            self.runners,
            self.clock.clone(),
            metrics.clone(),
            self.config,
        );
        if let Some(notifier) = self.notifier {
            controller = controller.with_notifier(notifier);
        }
        let controller = Arc::new(controller);

        let scheduling = SchedulingService::new(
            self.repositories.jobs.clone(),
            self.repositories.schedules.clone(),
            self.repositories.executions.clone(),
            controller.clone(),
            self.clock.clone(),
            metrics,
        );
        let recovery = Arc::new(RecoveryService::new(
            self.repositories.executions.clone(),
            controller.clone(),
            self.clock,
            pending_grace,
        ));

        Arc::new(JobEngine {
            repositories: self.repositories,
            controller,
            scheduling,
            recovery,
        })
    }
}
