use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsched_domain::{ExecutionLock, LockRepository};
use jobsched_errors::SchedulerResult;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

pub struct SqliteLockRepository {
    pool: SqlitePool,
}

impl SqliteLockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockRepository for SqliteLockRepository {
    /// 单条条件写：不存在则插入，存在且已过期则接管
    #[instrument(skip(self, lock), fields(job_id = lock.job_id, holder = %lock.lock_holder))]
    async fn try_acquire(&self, lock: &ExecutionLock) -> SchedulerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO execution_locks (job_id, lock_holder, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(job_id) DO UPDATE SET
                lock_holder = excluded.lock_holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE execution_locks.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(lock.job_id)
        .bind(&lock.lock_holder)
        .bind(MappingHelpers::to_millis(lock.acquired_at))
        .bind(MappingHelpers::to_millis(lock.expires_at))
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!("锁获取结果: {}", acquired);
        Ok(acquired)
    }

    #[instrument(skip(self))]
    async fn release(&self, job_id: i64, holder: &str) -> SchedulerResult<bool> {
        let result =
            sqlx::query("DELETE FROM execution_locks WHERE job_id = ?1 AND lock_holder = ?2")
                .bind(job_id)
                .bind(holder)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, job_id: i64) -> SchedulerResult<Option<ExecutionLock>> {
        let row = sqlx::query(
            "SELECT job_id, lock_holder, acquired_at, expires_at FROM execution_locks WHERE job_id = ?1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(ExecutionLock {
                job_id: row.try_get("job_id")?,
                lock_holder: row.try_get("lock_holder")?,
                acquired_at: MappingHelpers::get_time(&row, "acquired_at")?,
                expires_at: MappingHelpers::get_time(&row, "expires_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM execution_locks WHERE expires_at <= ?1")
            .bind(MappingHelpers::to_millis(now))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
