use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::entities::{Execution, ExecutionStatus, Job};
use jobsched_errors::SchedulerResult;

/// 执行器运行一次任务所需的上下文
#[derive(Debug, Clone)]
pub struct RunContext {
    pub execution_id: Uuid,
    /// 执行开始时的任务快照
    pub job: Job,
    pub parameters: serde_json::Value,
    pub cancellation: CancellationToken,
}

/// 任务执行器
///
/// 执行器需要协作式地响应 `cancellation`；取消后仍继续运行的执行器
/// 不会影响执行记录，其结果会被丢弃。
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, ctx: RunContext) -> SchedulerResult<serde_json::Value>;

    fn name(&self) -> &str;
}

/// 终态通知
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, execution: &Execution, status: ExecutionStatus) -> SchedulerResult<()>;
}

/// 时间来源
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
