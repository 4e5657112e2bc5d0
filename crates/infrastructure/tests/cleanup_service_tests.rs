use chrono::Duration;
use jobsched_config::RetentionConfig;
use jobsched_domain::{Clock, ExecutionLock, ExecutionStatus};
use jobsched_infrastructure::{CleanupService, InMemoryStore};
use jobsched_testing_utils::{ExecutionBuilder, ManualClock};
use std::sync::Arc;

fn retention(days: u32) -> RetentionConfig {
    RetentionConfig {
        enabled: true,
        sweep_interval_seconds: 3600,
        execution_retention_days: days,
        lock_sweep_enabled: true,
    }
}

#[tokio::test]
async fn test_cleanup_once_removes_aged_executions_and_expired_locks() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let clock = Arc::new(ManualClock::starting_now());
    let now = clock.now();

    let aged = ExecutionBuilder::new(1)
        .created_at(now - Duration::days(45))
        .finished(ExecutionStatus::Completed, now - Duration::days(45))
        .build();
    let fresh = ExecutionBuilder::new(1)
        .created_at(now - Duration::days(1))
        .finished(ExecutionStatus::Failed, now - Duration::days(1))
        .build();
    let old_pending = ExecutionBuilder::new(2)
        .created_at(now - Duration::days(90))
        .build();
    for execution in [&aged, &fresh, &old_pending] {
        repos.executions.create(execution).await.unwrap();
    }

    repos
        .locks
        .try_acquire(&ExecutionLock::new(1, "stale", now - Duration::hours(2), Duration::hours(1)))
        .await
        .unwrap();
    repos
        .locks
        .try_acquire(&ExecutionLock::new(2, "live", now, Duration::hours(1)))
        .await
        .unwrap();

    let service = CleanupService::new(
        repos.executions.clone(),
        repos.locks.clone(),
        clock.clone(),
        retention(30),
    );
    let stats = service.cleanup_once().await.unwrap();

    assert_eq!(stats.executions_deleted, 1);
    assert_eq!(stats.locks_removed, 1);
    assert!(repos.executions.get(aged.execution_id).await.unwrap().is_none());
    assert!(repos.executions.get(fresh.execution_id).await.unwrap().is_some());
    assert!(repos
        .executions
        .get(old_pending.execution_id)
        .await
        .unwrap()
        .is_some());
    assert!(repos.locks.get(2).await.unwrap().is_some());
}

#[tokio::test]
async fn test_lock_sweep_can_be_disabled() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let clock = Arc::new(ManualClock::starting_now());
    let now = clock.now();

    repos
        .locks
        .try_acquire(&ExecutionLock::new(1, "stale", now - Duration::hours(2), Duration::hours(1)))
        .await
        .unwrap();

    let mut config = retention(30);
    config.lock_sweep_enabled = false;
    let service = CleanupService::new(repos.executions.clone(), repos.locks.clone(), clock, config);

    let stats = service.cleanup_once().await.unwrap();
    assert_eq!(stats.locks_removed, 0);
    assert!(repos.locks.get(1).await.unwrap().is_some());
}

#[tokio::test]
async fn test_start_and_stop() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let clock = Arc::new(ManualClock::starting_now());

    let mut service = CleanupService::new(
        repos.executions.clone(),
        repos.locks.clone(),
        clock,
        retention(7),
    );
    assert!(!service.is_running());
    service.start().await.unwrap();
    assert!(service.is_running());
    service.stop().await.unwrap();
    assert!(!service.is_running());

    let mut disabled = CleanupService::new(
        repos.executions.clone(),
        repos.locks.clone(),
        Arc::new(ManualClock::starting_now()),
        RetentionConfig {
            enabled: false,
            ..retention(7)
        },
    );
    disabled.start().await.unwrap();
    assert!(!disabled.is_running());
}
