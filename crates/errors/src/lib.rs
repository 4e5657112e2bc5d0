use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 执行阶段，用于在错误和日志中还原一次执行的时间线
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionPhase {
    Admission,
    DependencyCheck,
    LockAcquisition,
    Start,
    Run,
    Completion,
    Failure,
    Cancellation,
    Statistics,
    Notification,
    Retention,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::Admission => "admission",
            ExecutionPhase::DependencyCheck => "dependency_check",
            ExecutionPhase::LockAcquisition => "lock_acquisition",
            ExecutionPhase::Start => "start",
            ExecutionPhase::Run => "run",
            ExecutionPhase::Completion => "completion",
            ExecutionPhase::Failure => "failure",
            ExecutionPhase::Cancellation => "cancellation",
            ExecutionPhase::Statistics => "statistics",
            ExecutionPhase::Notification => "notification",
            ExecutionPhase::Retention => "retention",
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 执行被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// 任务处于非活跃状态
    JobInactive,
    /// 阻塞型前置依赖在新鲜度窗口内没有成功执行
    DependencyUnsatisfied { blocking: Vec<i64>, detail: String },
    /// 依赖检查本身失败，按失败关闭处理
    DependencyCheckUnavailable { cause: String },
    /// (job, schedule) 关联已存在
    DuplicateScheduleLink { schedule_id: i64 },
}

impl RejectReason {
    /// 稳定的原因代码，供调用方做分支判断
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::JobInactive => "job inactive",
            RejectReason::DependencyUnsatisfied { .. } => "dependency unsatisfied",
            RejectReason::DependencyCheckUnavailable { .. } => "dependency check unavailable",
            RejectReason::DuplicateScheduleLink { .. } => "duplicate schedule link",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::JobInactive => write!(f, "{}: 任务未激活", self.code()),
            RejectReason::DependencyUnsatisfied { detail, .. } => {
                write!(f, "{}: {}", self.code(), detail)
            }
            RejectReason::DependencyCheckUnavailable { cause } => {
                write!(f, "{}: 依赖检查失败 - {}", self.code(), cause)
            }
            RejectReason::DuplicateScheduleLink { schedule_id } => {
                write!(f, "{}: 调度 {} 已关联", self.code(), schedule_id)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    JobNotFound { id: i64 },
    #[error("调度未找到: {id}")]
    ScheduleNotFound { id: i64 },
    #[error("执行实例未找到: {execution_id}")]
    ExecutionNotFound { execution_id: String },
    #[error("任务 {job_id} 的执行被拒绝: {reason}")]
    Rejected { job_id: i64, reason: RejectReason },
    #[error("任务 {job_id} 存在并发执行，执行实例 {execution_id} 未获得锁")]
    LockContention { job_id: i64, execution_id: String },
    #[error("任务执行失败: {0}")]
    RunnerFailure(String),
    #[error("存储失败 [阶段: {phase}, 任务: {job_id}, 执行实例: {execution_id}]: {cause}")]
    StorageFailure {
        phase: ExecutionPhase,
        job_id: i64,
        execution_id: String,
        cause: String,
    },
    #[error("无效的状态转换: 执行实例 {execution_id} 从 {from} 到 {to}")]
    InvalidTransition {
        execution_id: String,
        from: String,
        to: String,
    },
    #[error("检测到循环依赖: 任务 {dependent} -> {prerequisite}")]
    CircularDependency { dependent: i64, prerequisite: i64 },
    #[error("依赖关系已存在: 任务 {dependent} -> {prerequisite}")]
    DuplicateDependency { dependent: i64, prerequisite: i64 },
    #[error("无效的任务依赖: 任务 {dependent} 依赖任务 {prerequisite} - {reason}")]
    InvalidDependency {
        dependent: i64,
        prerequisite: i64,
        reason: String,
    },
    #[error("任务 {job_id} 与调度 {schedule_id} 的关联已存在")]
    DuplicateScheduleLink { job_id: i64, schedule_id: i64 },
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("无效的时区: {0}")]
    InvalidTimezone(String),
    #[error("未注册的执行器类型: {0}")]
    RunnerNotFound(String),
    #[error("任务执行超时")]
    ExecutionTimeout,
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn job_not_found(id: i64) -> Self {
        Self::JobNotFound { id }
    }
    pub fn execution_not_found<S: ToString>(execution_id: S) -> Self {
        Self::ExecutionNotFound {
            execution_id: execution_id.to_string(),
        }
    }
    pub fn rejected(job_id: i64, reason: RejectReason) -> Self {
        Self::Rejected { job_id, reason }
    }
    pub fn storage_failure<S: ToString>(
        phase: ExecutionPhase,
        job_id: i64,
        execution_id: S,
        cause: &SchedulerError,
    ) -> Self {
        Self::StorageFailure {
            phase,
            job_id,
            execution_id: execution_id.to_string(),
            cause: cause.to_string(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }

    /// 拒绝原因（仅对 `Rejected` 有值）
    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            SchedulerError::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }
    pub fn is_rejection(&self) -> bool {
        matches!(self, SchedulerError::Rejected { .. })
    }
    /// 是否属于存储层故障
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_)
                | SchedulerError::DatabaseOperation(_)
                | SchedulerError::StorageFailure { .. }
        )
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_)
                | SchedulerError::Configuration(_)
                | SchedulerError::StorageFailure { .. }
        )
    }
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::DatabaseOperation(_) | SchedulerError::LockContention { .. }
        )
    }
    pub fn user_message(&self) -> &str {
        match self {
            SchedulerError::JobNotFound { .. } => "请求的任务不存在",
            SchedulerError::ScheduleNotFound { .. } => "请求的调度不存在",
            SchedulerError::ExecutionNotFound { .. } => "请求的执行记录不存在",
            SchedulerError::Rejected { .. } => "任务当前不满足执行条件",
            SchedulerError::LockContention { .. } => "任务正在执行中，请稍后重试",
            SchedulerError::ValidationError(_) => "输入数据验证失败",
            SchedulerError::CircularDependency { .. } => "依赖关系会形成循环",
            SchedulerError::ExecutionTimeout => "任务执行超时",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
