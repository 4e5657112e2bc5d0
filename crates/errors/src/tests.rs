use crate::*;

#[test]
fn test_scheduler_error_display() {
    let db_op_error = SchedulerError::DatabaseOperation("Connection failed".to_string());
    assert_eq!(db_op_error.to_string(), "数据库操作错误: Connection failed");

    let job_error = SchedulerError::JobNotFound { id: 123 };
    assert_eq!(job_error.to_string(), "任务未找到: 123");

    let exec_error = SchedulerError::execution_not_found("abc");
    assert_eq!(exec_error.to_string(), "执行实例未找到: abc");

    let timeout_error = SchedulerError::ExecutionTimeout;
    assert_eq!(timeout_error.to_string(), "任务执行超时");

    let cycle = SchedulerError::CircularDependency {
        dependent: 1,
        prerequisite: 2,
    };
    assert_eq!(cycle.to_string(), "检测到循环依赖: 任务 1 -> 2");
}

#[test]
fn test_rejection_carries_reason_code() {
    let err = SchedulerError::rejected(
        7,
        RejectReason::DependencyUnsatisfied {
            blocking: vec![3],
            detail: "前置任务 3 未成功".to_string(),
        },
    );

    assert!(err.is_rejection());
    assert_eq!(
        err.reject_reason().map(RejectReason::code),
        Some("dependency unsatisfied")
    );
    assert!(err.to_string().contains("dependency unsatisfied"));
    assert!(!err.is_fatal());
}

#[test]
fn test_storage_failure_has_structured_detail() {
    let cause = SchedulerError::DatabaseOperation("disk full".to_string());
    let err = SchedulerError::storage_failure(ExecutionPhase::Start, 9, "exec-1", &cause);

    let message = err.to_string();
    assert!(message.contains("start"));
    assert!(message.contains("9"));
    assert!(message.contains("exec-1"));
    assert!(message.contains("disk full"));
    assert!(err.is_fatal());
    assert!(err.is_storage());
}

#[test]
fn test_error_classification() {
    let contention = SchedulerError::LockContention {
        job_id: 1,
        execution_id: "e".to_string(),
    };
    assert!(contention.is_retryable());
    assert!(!contention.is_fatal());

    let runner = SchedulerError::RunnerFailure("boom".to_string());
    assert!(!runner.is_retryable());
    assert_eq!(runner.user_message(), "系统繁忙，请稍后重试");
}

#[test]
fn test_from_serde_json_error() {
    let json_error = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
    let err: SchedulerError = json_error.into();
    assert!(matches!(err, SchedulerError::Serialization(_)));
}
