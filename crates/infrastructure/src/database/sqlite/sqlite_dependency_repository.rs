use async_trait::async_trait;
use chrono::Utc;
use jobsched_domain::{DependencyRepository, JobDependency};
use jobsched_errors::{SchedulerError, SchedulerResult};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::database::mapping::MappingHelpers;

pub struct SqliteDependencyRepository {
    pool: SqlitePool,
}

impl SqliteDependencyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_dependency(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<JobDependency> {
        Ok(JobDependency {
            dependent_job_id: row.try_get("dependent_job_id")?,
            prerequisite_job_id: row.try_get("prerequisite_job_id")?,
            dependency_type: row.try_get("dependency_type")?,
        })
    }

    async fn query_edges(
        &self,
        sql: &str,
        job_id: Option<i64>,
    ) -> SchedulerResult<Vec<JobDependency>> {
        let mut query = sqlx::query(sql);
        if let Some(job_id) = job_id {
            query = query.bind(job_id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_dependency).collect()
    }
}

#[async_trait]
impl DependencyRepository for SqliteDependencyRepository {
    #[instrument(skip(self, dependency), fields(
        dependent = dependency.dependent_job_id,
        prerequisite = dependency.prerequisite_job_id,
    ))]
    async fn add(&self, dependency: &JobDependency) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_dependencies (dependent_job_id, prerequisite_job_id, dependency_type, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(dependent_job_id, prerequisite_job_id) DO NOTHING
            "#,
        )
        .bind(dependency.dependent_job_id)
        .bind(dependency.prerequisite_job_id)
        .bind(dependency.dependency_type)
        .bind(MappingHelpers::to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::DuplicateDependency {
                dependent: dependency.dependent_job_id,
                prerequisite: dependency.prerequisite_job_id,
            });
        }
        Ok(())
    }

    async fn remove(
        &self,
        dependent_job_id: i64,
        prerequisite_job_id: i64,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM job_dependencies WHERE dependent_job_id = ?1 AND prerequisite_job_id = ?2",
        )
        .bind(dependent_job_id)
        .bind(prerequisite_job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn prerequisites_of(&self, job_id: i64) -> SchedulerResult<Vec<JobDependency>> {
        self.query_edges(
            "SELECT dependent_job_id, prerequisite_job_id, dependency_type FROM job_dependencies WHERE dependent_job_id = ?1 ORDER BY prerequisite_job_id",
            Some(job_id),
        )
        .await
    }

    async fn dependents_of(&self, job_id: i64) -> SchedulerResult<Vec<JobDependency>> {
        self.query_edges(
            "SELECT dependent_job_id, prerequisite_job_id, dependency_type FROM job_dependencies WHERE prerequisite_job_id = ?1 ORDER BY dependent_job_id",
            Some(job_id),
        )
        .await
    }

    async fn all(&self) -> SchedulerResult<Vec<JobDependency>> {
        self.query_edges(
            "SELECT dependent_job_id, prerequisite_job_id, dependency_type FROM job_dependencies ORDER BY dependent_job_id, prerequisite_job_id",
            None,
        )
        .await
    }
}
