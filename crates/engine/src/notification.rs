use async_trait::async_trait;
use tracing::info;

use jobsched_domain::{Execution, ExecutionStatus, NotificationDispatcher};
use jobsched_errors::SchedulerResult;

/// 只写日志的终态通知，未配置其它通知方式时使用
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LoggingNotificationDispatcher {
    async fn notify(&self, execution: &Execution, status: ExecutionStatus) -> SchedulerResult<()> {
        info!(
            event = "execution_notification",
            job.id = execution.job_id,
            execution.id = %execution.execution_id,
            execution.status = %status,
            "Terminal execution notification"
        );
        Ok(())
    }
}
