use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsched_domain::{JobSchedule, Schedule, ScheduleRepository, ScheduledJob};
use jobsched_errors::{SchedulerError, SchedulerResult};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

pub struct SqliteScheduleRepository {
    pool: SqlitePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_schedule(row: &sqlx::sqlite::SqliteRow, prefix: &str) -> SchedulerResult<Schedule> {
        Ok(Schedule {
            id: row.try_get(format!("{prefix}id").as_str())?,
            name: row.try_get(format!("{prefix}name").as_str())?,
            cron_expression: row.try_get(format!("{prefix}cron_expression").as_str())?,
            timezone: row.try_get(format!("{prefix}timezone").as_str())?,
            is_active: row.try_get(format!("{prefix}is_active").as_str())?,
            created_at: MappingHelpers::get_time(row, &format!("{prefix}created_at"))?,
        })
    }

    fn row_to_link(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<JobSchedule> {
        Ok(JobSchedule {
            job_id: row.try_get("job_id")?,
            schedule_id: row.try_get("schedule_id")?,
            is_active: row.try_get("is_active")?,
            last_fired_at: MappingHelpers::get_optional_time(row, "last_fired_at")?,
            created_at: MappingHelpers::get_time(row, "created_at")?,
        })
    }
}

const LINK_COLUMNS: &str = "job_id, schedule_id, is_active, last_fired_at, created_at";

#[async_trait]
impl ScheduleRepository for SqliteScheduleRepository {
    #[instrument(skip(self, schedule), fields(cron = %schedule.cron_expression))]
    async fn create_schedule(&self, schedule: &Schedule) -> SchedulerResult<Schedule> {
        let result = sqlx::query(
            r#"
            INSERT INTO schedules (name, cron_expression, timezone, is_active, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(&schedule.timezone)
        .bind(schedule.is_active)
        .bind(MappingHelpers::to_millis(schedule.created_at))
        .execute(&self.pool)
        .await?;

        let mut created = schedule.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn get_schedule(&self, id: i64) -> SchedulerResult<Option<Schedule>> {
        let row = sqlx::query(
            "SELECT id, name, cron_expression, timezone, is_active, created_at FROM schedules WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(|row| Self::row_to_schedule(row, ""))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn link(&self, job_id: i64, schedule_id: i64) -> SchedulerResult<JobSchedule> {
        let created_at = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO job_schedules (job_id, schedule_id, is_active, created_at)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(job_id, schedule_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(schedule_id)
        .bind(MappingHelpers::to_millis(created_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::DuplicateScheduleLink {
                job_id,
                schedule_id,
            });
        }

        debug!("任务 {} 关联调度 {}", job_id, schedule_id);
        Ok(JobSchedule {
            job_id,
            schedule_id,
            is_active: true,
            last_fired_at: None,
            created_at,
        })
    }

    async fn unlink(&self, job_id: i64, schedule_id: i64) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM job_schedules WHERE job_id = ?1 AND schedule_id = ?2")
            .bind(job_id)
            .bind(schedule_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_link(
        &self,
        job_id: i64,
        schedule_id: i64,
    ) -> SchedulerResult<Option<JobSchedule>> {
        let row = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM job_schedules WHERE job_id = ?1 AND schedule_id = ?2"
        ))
        .bind(job_id)
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_link).transpose()
    }

    async fn links_for_job(&self, job_id: i64) -> SchedulerResult<Vec<JobSchedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {LINK_COLUMNS} FROM job_schedules WHERE job_id = ?1 ORDER BY schedule_id"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_link).collect()
    }

    #[instrument(skip(self))]
    async fn set_links_active(&self, job_id: i64, active: bool) -> SchedulerResult<u64> {
        let result = sqlx::query("UPDATE job_schedules SET is_active = ?1 WHERE job_id = ?2")
            .bind(active)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn active_scheduled_jobs(&self) -> SchedulerResult<Vec<ScheduledJob>> {
        let rows = sqlx::query(
            r#"
            SELECT js.job_id, js.schedule_id, js.is_active, js.last_fired_at, js.created_at,
                   s.id AS s_id, s.name AS s_name, s.cron_expression AS s_cron_expression,
                   s.timezone AS s_timezone, s.is_active AS s_is_active, s.created_at AS s_created_at
            FROM job_schedules js
            JOIN schedules s ON s.id = js.schedule_id
            WHERE js.is_active = 1 AND s.is_active = 1
            ORDER BY js.job_id, js.schedule_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ScheduledJob {
                    link: Self::row_to_link(row)?,
                    schedule: Self::row_to_schedule(row, "s_")?,
                })
            })
            .collect()
    }

    async fn mark_fired(
        &self,
        job_id: i64,
        schedule_id: i64,
        fired_at: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        sqlx::query(
            "UPDATE job_schedules SET last_fired_at = ?1 WHERE job_id = ?2 AND schedule_id = ?3",
        )
        .bind(MappingHelpers::to_millis(fired_at))
        .bind(job_id)
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
