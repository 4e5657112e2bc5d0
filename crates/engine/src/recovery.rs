//! 孤儿执行恢复
//!
//! 进程异常退出后，其 RUNNING / PENDING 记录不会再有人推进。恢复服务在启动时
//! 和每个清理周期检查这些记录：RUNNING 执行的锁已不存在、已过期或换了持有者，
//! 或者 PENDING 执行长时间无人跟踪时，将其标记为 FAILED。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use jobsched_domain::{Clock, Execution, ExecutionRepository, ExecutionStatus};
use jobsched_errors::SchedulerResult;
use jobsched_infrastructure::StructuredLogger;

use crate::lifecycle::ExecutionController;

/// 一次恢复检查的结果
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub inspected: usize,
    pub recovered: Vec<Uuid>,
    pub recovery_duration_ms: u64,
    pub errors: Vec<String>,
}

pub struct RecoveryService {
    executions: Arc<dyn ExecutionRepository>,
    controller: Arc<ExecutionController>,
    clock: Arc<dyn Clock>,
    pending_grace: chrono::Duration,
}

impl RecoveryService {
    pub fn new(
        executions: Arc<dyn ExecutionRepository>,
        controller: Arc<ExecutionController>,
        clock: Arc<dyn Clock>,
        pending_grace: chrono::Duration,
    ) -> Self {
        Self {
            executions,
            controller,
            clock,
            pending_grace,
        }
    }

    /// 检查全部未结束执行，将失去持有者的标记为 FAILED
    #[instrument(skip(self))]
    pub async fn recover_orphaned_executions(&self) -> SchedulerResult<RecoveryReport> {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let mut report = RecoveryReport::default();

        for execution in self.executions.find_by_status(ExecutionStatus::Running).await? {
            report.inspected += 1;
            match self.running_orphan_reason(&execution, now).await {
                Ok(Some(reason)) => self.recover(&execution, reason, &mut report).await,
                Ok(None) => {}
                Err(e) => report.errors.push(format!(
                    "读取任务 {} 的执行锁失败: {}",
                    execution.job_id, e
                )),
            }
        }

        let cutoff = now - self.pending_grace;
        for execution in self.executions.find_by_status(ExecutionStatus::Pending).await? {
            report.inspected += 1;
            if execution.created_at > cutoff
                || self.controller.is_active(execution.execution_id).await
            {
                continue;
            }
            let reason = format!(
                "PENDING 超过 {} 秒且没有实例跟踪",
                self.pending_grace.num_seconds()
            );
            self.recover(&execution, reason, &mut report).await;
        }

        report.recovery_duration_ms = started.elapsed().as_millis() as u64;
        StructuredLogger::log_recovery_pass(
            report.inspected,
            report.recovered.len(),
            report.errors.len(),
        );
        Ok(report)
    }

    /// 启动后按固定间隔执行恢复检查，直到收到关闭信号
    pub async fn run(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        info!("启动孤儿执行恢复循环，间隔 {:?}", every);
        let mut ticker = tokio::time::interval(every);
        // 首次立即触发的 tick 由启动时的恢复检查代替
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.recover_orphaned_executions().await {
                        error!("孤儿执行恢复失败: {}", e);
                    }
                }
            }
        }
        info!("孤儿执行恢复循环已退出");
    }

    /// RUNNING 执行的锁已不属于它时返回原因
    async fn running_orphan_reason(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<String>> {
        let holder = execution.execution_id.to_string();
        // current 只返回未过期的锁
        let reason = match self.controller.lock_manager().current(execution.job_id).await? {
            None => format!("执行锁在 {} 时已不存在或已过期", now),
            Some(lock) if lock.lock_holder != holder => {
                format!("执行锁已由 {} 持有", lock.lock_holder)
            }
            Some(_) => return Ok(None),
        };
        Ok(Some(reason))
    }

    async fn recover(&self, execution: &Execution, reason: String, report: &mut RecoveryReport) {
        let previous = execution.status;
        match self.controller.fail_orphaned(execution, reason.clone()).await {
            Ok(true) => {
                StructuredLogger::log_execution_recovered(
                    execution.job_id,
                    execution.execution_id,
                    previous.as_str(),
                    &reason,
                );
                report.recovered.push(execution.execution_id);
            }
            // 读取之后执行已自行结束
            Ok(false) => {}
            Err(e) => report.errors.push(format!(
                "恢复执行实例 {} 失败: {}",
                execution.execution_id, e
            )),
        }
    }
}
