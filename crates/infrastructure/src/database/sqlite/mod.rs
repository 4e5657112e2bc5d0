pub mod sqlite_dependency_repository;
pub mod sqlite_execution_repository;
pub mod sqlite_job_repository;
pub mod sqlite_lock_repository;
pub mod sqlite_schedule_repository;
pub mod sqlite_statistics_repository;

pub use sqlite_dependency_repository::SqliteDependencyRepository;
pub use sqlite_execution_repository::SqliteExecutionRepository;
pub use sqlite_job_repository::SqliteJobRepository;
pub use sqlite_lock_repository::SqliteLockRepository;
pub use sqlite_schedule_repository::SqliteScheduleRepository;
pub use sqlite_statistics_repository::SqliteStatisticsRepository;

use jobsched_domain::Repositories;
use sqlx::SqlitePool;
use std::sync::Arc;

/// 基于同一连接池的全部 SQLite 仓储
pub fn repositories(pool: SqlitePool) -> Repositories {
    Repositories {
        jobs: Arc::new(SqliteJobRepository::new(pool.clone())),
        schedules: Arc::new(SqliteScheduleRepository::new(pool.clone())),
        dependencies: Arc::new(SqliteDependencyRepository::new(pool.clone())),
        executions: Arc::new(SqliteExecutionRepository::new(pool.clone())),
        locks: Arc::new(SqliteLockRepository::new(pool.clone())),
        statistics: Arc::new(SqliteStatisticsRepository::new(pool)),
    }
}
