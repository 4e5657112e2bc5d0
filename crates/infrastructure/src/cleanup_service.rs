use chrono::Duration;
use jobsched_config::RetentionConfig;
use jobsched_domain::{Clock, ExecutionRepository, LockRepository};
use jobsched_errors::SchedulerResult;
use std::sync::Arc;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::observability::StructuredLogger;

/// 单次清理的结果
#[derive(Debug, Clone, Default)]
pub struct CleanupStats {
    pub executions_deleted: u64,
    pub locks_removed: u64,
    pub duration: std::time::Duration,
}

/// 数据清理服务
///
/// 按固定间隔删除超过保留期的终态执行记录，并清理过期的执行锁。
pub struct CleanupService {
    execution_repository: Arc<dyn ExecutionRepository>,
    lock_repository: Arc<dyn LockRepository>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    cleanup_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CleanupService {
    pub fn new(
        execution_repository: Arc<dyn ExecutionRepository>,
        lock_repository: Arc<dyn LockRepository>,
        clock: Arc<dyn Clock>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            execution_repository,
            lock_repository,
            clock,
            config,
            shutdown_tx: None,
            cleanup_handle: None,
        }
    }

    pub async fn start(&mut self) -> SchedulerResult<()> {
        if !self.config.enabled {
            info!("数据清理服务未启用");
            return Ok(());
        }

        info!("启动数据清理服务: {:?}", self.config);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let execution_repository = self.execution_repository.clone();
        let lock_repository = self.lock_repository.clone();
        let clock = self.clock.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            let mut cleanup_interval =
                interval(std::time::Duration::from_secs(config.sweep_interval_seconds));

            loop {
                tokio::select! {
                    _ = cleanup_interval.tick() => {
                        if let Err(e) = Self::perform_cleanup(
                            &execution_repository,
                            &lock_repository,
                            clock.as_ref(),
                            &config,
                        ).await {
                            error!("数据清理失败: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("收到数据清理服务关闭信号");
                        break;
                    }
                }
            }
        });

        self.cleanup_handle = Some(handle);
        Ok(())
    }

    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(handle) = self.cleanup_handle.take() {
            if let Err(e) = handle.await {
                warn!("等待数据清理服务停止时出错: {}", e);
            }
        }

        info!("数据清理服务已停止");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.cleanup_handle.is_some()
    }

    /// 立即执行一次清理
    pub async fn cleanup_once(&self) -> SchedulerResult<CleanupStats> {
        Self::perform_cleanup(
            &self.execution_repository,
            &self.lock_repository,
            self.clock.as_ref(),
            &self.config,
        )
        .await
    }

    async fn perform_cleanup(
        execution_repository: &Arc<dyn ExecutionRepository>,
        lock_repository: &Arc<dyn LockRepository>,
        clock: &dyn Clock,
        config: &RetentionConfig,
    ) -> SchedulerResult<CleanupStats> {
        let start_time = std::time::Instant::now();
        let now = clock.now();
        let mut stats = CleanupStats::default();

        let cutoff = now - Duration::days(i64::from(config.execution_retention_days));
        stats.executions_deleted = execution_repository.delete_terminal_before(cutoff).await?;
        StructuredLogger::log_retention_sweep(
            stats.executions_deleted,
            config.execution_retention_days,
        );

        if config.lock_sweep_enabled {
            stats.locks_removed = lock_repository.delete_expired(now).await?;
            if stats.locks_removed > 0 {
                StructuredLogger::log_lock_swept(stats.locks_removed);
            }
        }

        stats.duration = start_time.elapsed();
        Ok(stats)
    }
}
