use async_trait::async_trait;
use chrono::Utc;
use jobsched_domain::{Job, JobRepository, JobStatus};
use jobsched_errors::SchedulerResult;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

pub struct SqliteJobRepository {
    pool: SqlitePool,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Job> {
        let timeout: Option<i64> = row.try_get("timeout_seconds")?;
        Ok(Job {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            job_type: row.try_get("job_type")?,
            default_parameters: MappingHelpers::get_json(row, "default_parameters")?,
            status: row.try_get("status")?,
            timeout_seconds: timeout.map(|t| t.max(0) as u64),
            created_at: MappingHelpers::get_time(row, "created_at")?,
            updated_at: MappingHelpers::get_time(row, "updated_at")?,
        })
    }
}

const JOB_COLUMNS: &str =
    "id, name, job_type, default_parameters, status, timeout_seconds, created_at, updated_at";

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self, job), fields(job_name = %job.name, job_type = %job.job_type))]
    async fn create(&self, job: &Job) -> SchedulerResult<Job> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (name, job_type, default_parameters, status, timeout_seconds, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&job.name)
        .bind(&job.job_type)
        .bind(serde_json::to_string(&job.default_parameters)?)
        .bind(job.status)
        .bind(job.timeout_seconds.map(|t| t as i64))
        .bind(MappingHelpers::to_millis(job.created_at))
        .bind(MappingHelpers::to_millis(job.updated_at))
        .execute(&self.pool)
        .await?;

        let mut created = job.clone();
        created.id = result.last_insert_rowid();
        debug!("创建任务成功: {} (ID: {})", created.name, created.id);
        Ok(created)
    }

    async fn get_job(&self, id: i64) -> SchedulerResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn list_jobs(&self) -> SchedulerResult<Vec<Job>> {
        let rows = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    #[instrument(skip(self))]
    async fn set_status(&self, id: i64, status: JobStatus) -> SchedulerResult<bool> {
        let result = sqlx::query("UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status)
            .bind(MappingHelpers::to_millis(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
