//! 任务执行核心
//!
//! 触发 → 依赖检查 → 锁获取 → 生命周期控制 → 执行器 → 结果记录 → 统计与通知。

pub mod cron_utils;
pub mod dependency_resolver;
pub mod engine;
pub mod lifecycle;
pub mod lock_manager;
pub mod notification;
pub mod recovery;
pub mod runners;
pub mod scheduling;
pub mod statistics;
pub mod trigger;

pub use cron_utils::CronScheduler;
pub use dependency_resolver::{DependencyCheckResult, DependencyResolver};
pub use engine::{JobEngine, JobEngineBuilder, HEALTH_SAMPLE_SIZE};
pub use lifecycle::{ExecutionController, StartOutcome};
pub use lock_manager::LockManager;
pub use notification::LoggingNotificationDispatcher;
pub use recovery::{RecoveryReport, RecoveryService};
pub use runners::{HttpRunner, RunnerRegistry, ShellRunner};
pub use scheduling::SchedulingService;
pub use statistics::StatisticsAggregator;
pub use trigger::{CronTriggerSource, TriggerSignal};
