use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use jobsched_domain::{DailyStatistics, StatisticsRecord, StatisticsRepository};
use jobsched_errors::SchedulerResult;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

pub struct SqliteStatisticsRepository {
    pool: SqlitePool,
}

const STATS_COLUMNS: &str = "job_id, stat_date, total_executions, successful_executions, \
     failed_executions, timed_executions, total_duration_ms, min_duration_ms, max_duration_ms";

impl SqliteStatisticsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_stats(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<DailyStatistics> {
        Ok(DailyStatistics {
            job_id: row.try_get("job_id")?,
            stat_date: row.try_get("stat_date")?,
            total_executions: row.try_get("total_executions")?,
            successful_executions: row.try_get("successful_executions")?,
            failed_executions: row.try_get("failed_executions")?,
            timed_executions: row.try_get("timed_executions")?,
            total_duration_ms: row.try_get("total_duration_ms")?,
            min_duration_ms: row.try_get("min_duration_ms")?,
            max_duration_ms: row.try_get("max_duration_ms")?,
        })
    }
}

#[async_trait]
impl StatisticsRepository for SqliteStatisticsRepository {
    /// 去重记录与计数累加在同一事务中完成
    #[instrument(skip(self, record), fields(
        job_id = record.job_id,
        execution_id = %record.execution_id,
        stat_date = %record.stat_date,
    ))]
    async fn record(&self, record: &StatisticsRecord) -> SchedulerResult<bool> {
        let now = MappingHelpers::to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        let ledger = sqlx::query(
            r#"
            INSERT OR IGNORE INTO statistics_ledger (execution_id, job_id, stat_date, recorded_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(record.execution_id.to_string())
        .bind(record.job_id)
        .bind(record.stat_date)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if ledger.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("执行 {} 已计入统计，忽略重复投递", record.execution_id);
            return Ok(false);
        }

        let (successful, failed) = if record.successful { (1i64, 0i64) } else { (0, 1) };
        let timed = i64::from(record.duration_ms.is_some());

        sqlx::query(
            r#"
            INSERT INTO job_statistics (job_id, stat_date, total_executions, successful_executions,
                failed_executions, timed_executions, total_duration_ms, min_duration_ms,
                max_duration_ms, updated_at)
            VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?7, ?8)
            ON CONFLICT(job_id, stat_date) DO UPDATE SET
                total_executions = total_executions + 1,
                successful_executions = successful_executions + excluded.successful_executions,
                failed_executions = failed_executions + excluded.failed_executions,
                timed_executions = timed_executions + excluded.timed_executions,
                total_duration_ms = total_duration_ms + excluded.total_duration_ms,
                min_duration_ms = CASE
                    WHEN excluded.min_duration_ms IS NULL THEN min_duration_ms
                    WHEN min_duration_ms IS NULL THEN excluded.min_duration_ms
                    ELSE MIN(min_duration_ms, excluded.min_duration_ms)
                END,
                max_duration_ms = CASE
                    WHEN excluded.max_duration_ms IS NULL THEN max_duration_ms
                    WHEN max_duration_ms IS NULL THEN excluded.max_duration_ms
                    ELSE MAX(max_duration_ms, excluded.max_duration_ms)
                END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.job_id)
        .bind(record.stat_date)
        .bind(successful)
        .bind(failed)
        .bind(timed)
        .bind(record.duration_ms.unwrap_or(0))
        .bind(record.duration_ms)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get(&self, job_id: i64, date: NaiveDate) -> SchedulerResult<Option<DailyStatistics>> {
        let row = sqlx::query(&format!(
            "SELECT {STATS_COLUMNS} FROM job_statistics WHERE job_id = ?1 AND stat_date = ?2"
        ))
        .bind(job_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_stats).transpose()
    }

    async fn range(
        &self,
        job_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> SchedulerResult<Vec<DailyStatistics>> {
        let rows = sqlx::query(&format!(
            "SELECT {STATS_COLUMNS} FROM job_statistics \
             WHERE job_id = ?1 AND stat_date >= ?2 AND stat_date <= ?3 ORDER BY stat_date"
        ))
        .bind(job_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_stats).collect()
    }

    #[instrument(skip(self, stats, execution_ids), fields(job_id = stats.job_id, stat_date = %stats.stat_date))]
    async fn replace(&self, stats: &DailyStatistics, execution_ids: &[Uuid]) -> SchedulerResult<()> {
        let now = MappingHelpers::to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM statistics_ledger WHERE job_id = ?1 AND stat_date = ?2")
            .bind(stats.job_id)
            .bind(stats.stat_date)
            .execute(&mut *tx)
            .await?;

        for execution_id in execution_ids {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO statistics_ledger (execution_id, job_id, stat_date, recorded_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(execution_id.to_string())
            .bind(stats.job_id)
            .bind(stats.stat_date)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO job_statistics ({STATS_COLUMNS}, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ))
        .bind(stats.job_id)
        .bind(stats.stat_date)
        .bind(stats.total_executions)
        .bind(stats.successful_executions)
        .bind(stats.failed_executions)
        .bind(stats.timed_executions)
        .bind(stats.total_duration_ms)
        .bind(stats.min_duration_ms)
        .bind(stats.max_duration_ms)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
