use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use jobsched_config::EngineConfig;
use jobsched_domain::{Clock, ExecutionLock, ExecutionStatus, Repositories};
use jobsched_engine::lifecycle::HOLDER_LOST_MESSAGE;
use jobsched_engine::JobEngine;
use jobsched_infrastructure::InMemoryStore;
use jobsched_testing_utils::{ExecutionBuilder, JobBuilder, ManualClock, MockRunner};

fn engine_with_clock(repos: Repositories, clock: Arc<ManualClock>) -> Arc<JobEngine> {
    JobEngine::builder(repos, EngineConfig::with_freshness_window(3600))
        .with_runner("mock", Arc::new(MockRunner::new("mock")))
        .with_clock(clock)
        .build()
}

#[tokio::test]
async fn test_recovery_fails_executions_whose_holder_is_gone() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(now));
    let engine = engine_with_clock(repos.clone(), clock.clone());

    let mut job_ids = Vec::new();
    for _ in 0..5 {
        job_ids.push(repos.jobs.create(&JobBuilder::new().build()).await.unwrap().id);
    }
    let started = now - Duration::hours(3);

    // 锁已过期
    let expired = ExecutionBuilder::new(job_ids[0])
        .created_at(started)
        .running_since(started)
        .build();
    repos.executions.create(&expired).await.unwrap();
    repos
        .locks
        .try_acquire(&ExecutionLock::new(
            job_ids[0],
            expired.execution_id.to_string(),
            started,
            Duration::hours(1),
        ))
        .await
        .unwrap();

    // 锁已被其他实例持有
    let taken = ExecutionBuilder::new(job_ids[1])
        .created_at(started)
        .running_since(started)
        .build();
    repos.executions.create(&taken).await.unwrap();
    repos
        .locks
        .try_acquire(&ExecutionLock::new(job_ids[1], "another-instance", now, Duration::hours(1)))
        .await
        .unwrap();

    // 仍持有自己的有效锁
    let healthy = ExecutionBuilder::new(job_ids[2])
        .created_at(now - Duration::minutes(5))
        .running_since(now - Duration::minutes(5))
        .build();
    repos.executions.create(&healthy).await.unwrap();
    repos
        .locks
        .try_acquire(&ExecutionLock::new(
            job_ids[2],
            healthy.execution_id.to_string(),
            now - Duration::minutes(5),
            Duration::hours(1),
        ))
        .await
        .unwrap();

    let stale_pending = ExecutionBuilder::new(job_ids[3]).created_at(started).build();
    repos.executions.create(&stale_pending).await.unwrap();
    let fresh_pending = ExecutionBuilder::new(job_ids[4]).created_at(now).build();
    repos.executions.create(&fresh_pending).await.unwrap();

    let report = engine.recover_orphaned_executions().await.unwrap();
    assert_eq!(report.inspected, 5);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.recovered.len(), 3);
    for id in [expired.execution_id, taken.execution_id, stale_pending.execution_id] {
        assert!(report.recovered.contains(&id));
        let failed = engine.get_execution_status(id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some(HOLDER_LOST_MESSAGE));
        assert!(failed.error_detail.is_some());
        assert_eq!(failed.ended_at, Some(now));
    }
    let running_duration = engine
        .get_execution_status(expired.execution_id)
        .await
        .unwrap()
        .duration_ms;
    assert_eq!(running_duration, Some(Duration::hours(3).num_milliseconds()));

    assert_eq!(
        engine.get_execution_status(healthy.execution_id).await.unwrap().status,
        ExecutionStatus::Running
    );
    assert_eq!(
        engine.get_execution_status(fresh_pending.execution_id).await.unwrap().status,
        ExecutionStatus::Pending
    );

    // 其他实例持有的锁不受影响
    let other = engine.lock_manager().current(job_ids[1]).await.unwrap().unwrap();
    assert_eq!(other.lock_holder, "another-instance");

    for job_id in [job_ids[0], job_ids[1], job_ids[3]] {
        let stats = engine
            .statistics()
            .daily(job_id, now.date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.failed_executions, 1);
    }
    let recovered = engine.get_execution_status(expired.execution_id).await.unwrap();
    assert!(!engine.statistics().record_execution(&recovered).await.unwrap());

    let again = engine.recover_orphaned_executions().await.unwrap();
    assert_eq!(again.inspected, 2);
    assert!(again.recovered.is_empty());
}

#[tokio::test]
async fn test_recovery_waits_for_pending_grace_period() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).unwrap()));
    let mut config = EngineConfig::with_freshness_window(3600);
    config.orphan_pending_seconds = Some(600);
    let engine = JobEngine::builder(repos.clone(), config)
        .with_runner("mock", Arc::new(MockRunner::new("mock")))
        .with_clock(clock.clone())
        .build();
    let job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();

    let pending = ExecutionBuilder::new(job.id).created_at(clock.now()).build();
    repos.executions.create(&pending).await.unwrap();

    clock.advance_secs(300);
    assert!(engine.recover_orphaned_executions().await.unwrap().recovered.is_empty());

    clock.advance_secs(301);
    let report = engine.recover_orphaned_executions().await.unwrap();
    assert_eq!(report.recovered, vec![pending.execution_id]);
    assert_eq!(
        engine.get_execution_status(pending.execution_id).await.unwrap().status,
        ExecutionStatus::Failed
    );
}
