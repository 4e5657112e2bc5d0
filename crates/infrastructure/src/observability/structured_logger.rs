//! Structured logging events for the execution core
//!
//! Every lifecycle event carries the job id, the execution id and the
//! phase, so a single execution can be traced end to end from the logs.

use jobsched_errors::{ExecutionPhase, SchedulerError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_execution_admitted(job_id: i64, execution_id: Uuid, schedule_id: Option<i64>) {
        info!(
            event = "execution_admitted",
            job.id = job_id,
            execution.id = %execution_id,
            schedule.id = ?schedule_id,
            "Execution admitted"
        );
    }

    pub fn log_execution_rejected(job_id: i64, reason_code: &str, detail: &str) {
        warn!(
            event = "execution_rejected",
            job.id = job_id,
            reject.reason = reason_code,
            reject.detail = detail,
            "Execution rejected"
        );
    }

    pub fn log_lock_contention(job_id: i64, execution_id: Uuid, attempt: u32, will_requeue: bool) {
        warn!(
            event = "lock_contention",
            job.id = job_id,
            execution.id = %execution_id,
            lock.attempt = attempt,
            lock.requeue = will_requeue,
            "Execution lock held by another execution"
        );
    }

    pub fn log_execution_started(job_id: i64, execution_id: Uuid, job_type: &str) {
        info!(
            event = "execution_started",
            job.id = job_id,
            job.type = job_type,
            execution.id = %execution_id,
            "Execution started"
        );
    }

    pub fn log_execution_completed(job_id: i64, execution_id: Uuid, duration_ms: Option<i64>) {
        info!(
            event = "execution_completed",
            job.id = job_id,
            execution.id = %execution_id,
            execution.duration_ms = ?duration_ms,
            "Execution completed successfully"
        );
    }

    pub fn log_execution_failed(
        job_id: i64,
        execution_id: Uuid,
        phase: ExecutionPhase,
        error_message: &str,
    ) {
        error!(
            event = "execution_failed",
            job.id = job_id,
            execution.id = %execution_id,
            execution.phase = %phase,
            execution.error = error_message,
            "Execution failed"
        );
    }

    pub fn log_execution_cancelled(job_id: i64, execution_id: Uuid, reason: &str) {
        warn!(
            event = "execution_cancelled",
            job.id = job_id,
            execution.id = %execution_id,
            cancel.reason = reason,
            "Execution cancelled"
        );
    }

    pub fn log_dependency_check(job_id: i64, allowed: bool, blocking: &[i64], reason: Option<&str>) {
        if allowed {
            debug!(
                event = "dependency_check",
                job.id = job_id,
                dependency.allowed = allowed,
                "Job dependencies satisfied"
            );
        } else {
            warn!(
                event = "dependency_check",
                job.id = job_id,
                dependency.allowed = allowed,
                dependency.blocking = ?blocking,
                dependency.reason = reason.unwrap_or("unknown"),
                "Job dependencies not satisfied"
            );
        }
    }

    pub fn log_storage_failure(
        job_id: i64,
        execution_id: Uuid,
        phase: ExecutionPhase,
        cause: &SchedulerError,
    ) {
        error!(
            event = "storage_failure",
            job.id = job_id,
            execution.id = %execution_id,
            execution.phase = %phase,
            error = %cause,
            "Storage operation failed"
        );
    }

    pub fn log_statistics_recorded(job_id: i64, execution_id: Uuid, counted: bool) {
        debug!(
            event = "statistics_recorded",
            job.id = job_id,
            execution.id = %execution_id,
            statistics.counted = counted,
            "Execution folded into daily statistics"
        );
    }

    pub fn log_lock_swept(removed: u64) {
        info!(
            event = "lock_swept",
            lock.removed = removed,
            "Expired execution locks removed"
        );
    }

    pub fn log_execution_recovered(job_id: i64, execution_id: Uuid, previous_status: &str, reason: &str) {
        warn!(
            event = "execution_recovered",
            job.id = job_id,
            execution.id = %execution_id,
            execution.previous_status = previous_status,
            recovery.reason = reason,
            "Orphaned execution marked as failed"
        );
    }

    pub fn log_recovery_pass(inspected: usize, recovered: usize, errors: usize) {
        if recovered > 0 || errors > 0 {
            warn!(
                event = "recovery_pass",
                recovery.inspected = inspected,
                recovery.recovered = recovered,
                recovery.errors = errors,
                "Orphaned executions recovered"
            );
        } else {
            debug!(
                event = "recovery_pass",
                recovery.inspected = inspected,
                "No orphaned executions found"
            );
        }
    }

    pub fn log_retention_sweep(deleted: u64, retention_days: u32) {
        info!(
            event = "retention_sweep",
            retention.deleted = deleted,
            retention.days = retention_days,
            "Old terminal executions removed"
        );
    }
}
