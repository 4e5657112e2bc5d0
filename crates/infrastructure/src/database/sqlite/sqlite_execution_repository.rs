use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsched_domain::{Execution, ExecutionRepository, ExecutionStatus, JobExecutionSummary};
use jobsched_errors::SchedulerResult;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

pub struct SqliteExecutionRepository {
    pool: SqlitePool,
}

const EXECUTION_COLUMNS: &str = "execution_id, job_id, schedule_id, status, parameters, created_at, \
     started_at, ended_at, duration_ms, result, error_message, error_detail";

const TERMINAL_FILTER: &str = "status IN ('COMPLETED', 'FAILED', 'CANCELLED')";

impl SqliteExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Execution> {
        Ok(Execution {
            execution_id: MappingHelpers::get_uuid(row, "execution_id")?,
            job_id: row.try_get("job_id")?,
            schedule_id: row.try_get("schedule_id")?,
            status: row.try_get("status")?,
            parameters: MappingHelpers::get_json(row, "parameters")?,
            created_at: MappingHelpers::get_time(row, "created_at")?,
            started_at: MappingHelpers::get_optional_time(row, "started_at")?,
            ended_at: MappingHelpers::get_optional_time(row, "ended_at")?,
            duration_ms: row.try_get("duration_ms")?,
            result: MappingHelpers::get_optional_json(row, "result")?,
            error_message: row.try_get("error_message")?,
            error_detail: row.try_get("error_detail")?,
        })
    }

    fn rows_to_executions(rows: &[sqlx::sqlite::SqliteRow]) -> SchedulerResult<Vec<Execution>> {
        rows.iter().map(Self::row_to_execution).collect()
    }
}

#[async_trait]
impl ExecutionRepository for SqliteExecutionRepository {
    #[instrument(skip(self, execution), fields(
        execution_id = %execution.execution_id,
        job_id = execution.job_id,
    ))]
    async fn create(&self, execution: &Execution) -> SchedulerResult<()> {
        sqlx::query(&format!(
            "INSERT INTO job_executions ({EXECUTION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ))
        .bind(execution.execution_id.to_string())
        .bind(execution.job_id)
        .bind(execution.schedule_id)
        .bind(execution.status)
        .bind(serde_json::to_string(&execution.parameters)?)
        .bind(MappingHelpers::to_millis(execution.created_at))
        .bind(execution.started_at.map(MappingHelpers::to_millis))
        .bind(execution.ended_at.map(MappingHelpers::to_millis))
        .bind(execution.duration_ms)
        .bind(execution.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&execution.error_message)
        .bind(&execution.error_detail)
        .execute(&self.pool)
        .await?;

        debug!("创建执行记录: {}", execution.execution_id);
        Ok(())
    }

    async fn get(&self, execution_id: Uuid) -> SchedulerResult<Option<Execution>> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE execution_id = ?1"
        ))
        .bind(execution_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    #[instrument(skip(self, execution), fields(
        execution_id = %execution.execution_id,
        to = %execution.status,
    ))]
    async fn update_if_status(
        &self,
        execution: &Execution,
        expected: &[ExecutionStatus],
    ) -> SchedulerResult<bool> {
        if expected.is_empty() {
            return Ok(false);
        }

        let sql = format!(
            "UPDATE job_executions SET status = ?, started_at = ?, ended_at = ?, duration_ms = ?, \
             result = ?, error_message = ?, error_detail = ? \
             WHERE execution_id = ? AND status IN ({})",
            MappingHelpers::placeholders(expected.len())
        );

        let mut query = sqlx::query(&sql)
            .bind(execution.status)
            .bind(execution.started_at.map(MappingHelpers::to_millis))
            .bind(execution.ended_at.map(MappingHelpers::to_millis))
            .bind(execution.duration_ms)
            .bind(execution.result.as_ref().map(serde_json::to_string).transpose()?)
            .bind(&execution.error_message)
            .bind(&execution.error_detail)
            .bind(execution.execution_id.to_string());
        for status in expected {
            query = query.bind(*status);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn most_recent_terminal(
        &self,
        job_id: i64,
        since: DateTime<Utc>,
    ) -> SchedulerResult<Option<Execution>> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions \
             WHERE job_id = ?1 AND {TERMINAL_FILTER} AND ended_at >= ?2 \
             ORDER BY ended_at DESC LIMIT 1"
        ))
        .bind(job_id)
        .bind(MappingHelpers::to_millis(since))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn find_by_job(&self, job_id: i64, limit: i64) -> SchedulerResult<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE job_id = ?1 \
             ORDER BY created_at DESC LIMIT ?2"
        ))
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Self::rows_to_executions(&rows)
    }

    async fn find_by_status(&self, status: ExecutionStatus) -> SchedulerResult<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE status = ?1 ORDER BY created_at DESC"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Self::rows_to_executions(&rows)
    }

    async fn find_recent(&self, limit: i64) -> SchedulerResult<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions ORDER BY created_at DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Self::rows_to_executions(&rows)
    }

    async fn find_non_terminal(&self, job_id: i64) -> SchedulerResult<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions \
             WHERE job_id = ?1 AND status IN ('PENDING', 'RUNNING') ORDER BY created_at"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Self::rows_to_executions(&rows)
    }

    async fn find_terminal_between(
        &self,
        job_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions \
             WHERE job_id = ?1 AND {TERMINAL_FILTER} AND ended_at >= ?2 AND ended_at < ?3 \
             ORDER BY ended_at"
        ))
        .bind(job_id)
        .bind(MappingHelpers::to_millis(from))
        .bind(MappingHelpers::to_millis(to))
        .fetch_all(&self.pool)
        .await?;

        Self::rows_to_executions(&rows)
    }

    async fn summary(&self, job_id: i64) -> SchedulerResult<JobExecutionSummary> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS cnt FROM job_executions WHERE job_id = ?1 GROUP BY status",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = JobExecutionSummary {
            job_id,
            ..Default::default()
        };
        for row in &rows {
            let status: ExecutionStatus = row.try_get("status")?;
            let count: i64 = row.try_get("cnt")?;
            summary.add(status, count);
        }
        Ok(summary)
    }

    #[instrument(skip(self))]
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM job_executions WHERE {TERMINAL_FILTER} AND ended_at < ?1"
        ))
        .bind(MappingHelpers::to_millis(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
