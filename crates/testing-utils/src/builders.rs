//! Test data builders for creating test entities
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use chrono::{DateTime, Utc};
use jobsched_domain::{Execution, ExecutionStatus, Job, JobStatus, Schedule};
use uuid::Uuid;

/// Builder for creating test Job entities
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        let mut job = Job::new("test_job", "mock");
        job.id = 1;
        Self { job }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.job.id = id;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.job.name = name.to_string();
        self
    }

    pub fn with_job_type(mut self, job_type: &str) -> Self {
        self.job.job_type = job_type.to_string();
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.job.default_parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.job.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.job.status = JobStatus::Inactive;
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test Schedule entities
pub struct ScheduleBuilder {
    schedule: Schedule,
}

impl ScheduleBuilder {
    pub fn new() -> Self {
        Self {
            schedule: Schedule::new("test_schedule", "0 * * * * *"),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.schedule.name = name.to_string();
        self
    }

    pub fn with_cron(mut self, cron_expression: &str) -> Self {
        self.schedule.cron_expression = cron_expression.to_string();
        self
    }

    pub fn with_timezone(mut self, timezone: &str) -> Self {
        self.schedule.timezone = timezone.to_string();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.schedule.is_active = false;
        self
    }

    pub fn build(self) -> Schedule {
        self.schedule
    }
}

impl Default for ScheduleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test Execution entities
pub struct ExecutionBuilder {
    execution: Execution,
}

impl ExecutionBuilder {
    pub fn new(job_id: i64) -> Self {
        Self {
            execution: Execution::new(job_id, None, serde_json::json!({}), Utc::now()),
        }
    }

    pub fn with_id(mut self, execution_id: Uuid) -> Self {
        self.execution.execution_id = execution_id;
        self
    }

    pub fn with_schedule(mut self, schedule_id: i64) -> Self {
        self.execution.schedule_id = Some(schedule_id);
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.execution.created_at = created_at;
        self
    }

    pub fn running_since(mut self, started_at: DateTime<Utc>) -> Self {
        self.execution.status = ExecutionStatus::Running;
        self.execution.started_at = Some(started_at);
        self
    }

    /// Terminal execution ending at `ended_at`; duration is derived from `started_at` if set
    pub fn finished(mut self, status: ExecutionStatus, ended_at: DateTime<Utc>) -> Self {
        self.execution.finish(status, ended_at);
        self
    }

    pub fn completed_at(self, ended_at: DateTime<Utc>) -> Self {
        self.finished(ExecutionStatus::Completed, ended_at)
    }

    pub fn failed_at(mut self, ended_at: DateTime<Utc>, message: &str) -> Self {
        self.execution.error_message = Some(message.to_string());
        self.finished(ExecutionStatus::Failed, ended_at)
    }

    pub fn build(self) -> Execution {
        self.execution
    }
}
