use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use jobsched_config::{EngineConfig, TriggerConfig};
use jobsched_domain::{ExecutionStatus, JobStatus, RejectReason, Repositories, SchedulerError};
use jobsched_engine::{
    CronTriggerSource, JobEngine, SchedulingService, TriggerSignal, HEALTH_SAMPLE_SIZE,
};
use jobsched_infrastructure::InMemoryStore;
use jobsched_testing_utils::{
    ExecutionBuilder, JobBuilder, ManualClock, MockRunner, ScheduleBuilder, TestEnv,
};

fn trigger_config(poll_interval_seconds: u64) -> TriggerConfig {
    TriggerConfig {
        enabled: true,
        poll_interval_seconds,
    }
}

fn engine_with_clock(repos: Repositories, clock: Arc<ManualClock>) -> Arc<JobEngine> {
    JobEngine::builder(repos, EngineConfig::with_freshness_window(3600))
        .with_runner("mock", Arc::new(MockRunner::new("mock")))
        .with_clock(clock)
        .build()
}

#[tokio::test]
async fn test_schedule_job_rejects_duplicate_link() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let engine = engine_with_clock(repos.clone(), Arc::new(ManualClock::starting_now()));
    let job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();
    let schedule = engine
        .scheduling()
        .create_schedule(&ScheduleBuilder::new().build())
        .await
        .unwrap();

    let link = engine.scheduling().schedule_job(job.id, schedule.id).await.unwrap();
    assert!(link.is_active);
    assert!(link.last_fired_at.is_none());

    let result = engine.scheduling().schedule_job(job.id, schedule.id).await;
    match result {
        Err(SchedulerError::Rejected {
            reason: RejectReason::DuplicateScheduleLink { schedule_id },
            ..
        }) => assert_eq!(schedule_id, schedule.id),
        other => panic!("expected duplicate link rejection, got {other:?}"),
    }

    assert!(matches!(
        engine.scheduling().schedule_job(777, schedule.id).await,
        Err(SchedulerError::JobNotFound { id: 777 })
    ));
    assert!(matches!(
        engine.scheduling().schedule_job(job.id, 888).await,
        Err(SchedulerError::ScheduleNotFound { id: 888 })
    ));
}

#[tokio::test]
async fn test_create_schedule_validates_definition() {
    let store = Arc::new(InMemoryStore::new());
    let engine = engine_with_clock(store.repositories(), Arc::new(ManualClock::starting_now()));

    let bad_cron = ScheduleBuilder::new().with_cron("not a cron").build();
    assert!(matches!(
        engine.scheduling().create_schedule(&bad_cron).await,
        Err(SchedulerError::InvalidCron { .. })
    ));

    let bad_tz = ScheduleBuilder::new().with_timezone("Mars/Olympus").build();
    assert!(matches!(
        engine.scheduling().create_schedule(&bad_tz).await,
        Err(SchedulerError::InvalidTimezone(_))
    ));

    assert!(SchedulingService::validate_cron_expression("0 */5 * * * *").is_ok());
    assert!(SchedulingService::validate_cron_expression("61 * * * * *").is_err());
}

#[tokio::test]
async fn test_pause_resume_and_next_fire_times() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap()));
    let engine = engine_with_clock(repos.clone(), clock.clone());
    let scheduling = engine.scheduling();

    let job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();
    let hourly = scheduling
        .create_schedule(&ScheduleBuilder::new().with_cron("0 0 * * * *").build())
        .await
        .unwrap();
    let quarterly = scheduling
        .create_schedule(&ScheduleBuilder::new().with_cron("0 */15 * * * *").build())
        .await
        .unwrap();

    assert!(!scheduling.is_job_scheduled(job.id).await.unwrap());
    assert!(scheduling.next_execution_time(job.id).await.unwrap().is_none());

    scheduling.schedule_job(job.id, hourly.id).await.unwrap();
    scheduling.schedule_job(job.id, quarterly.id).await.unwrap();
    assert!(scheduling.is_job_scheduled(job.id).await.unwrap());

    assert_eq!(
        scheduling.next_execution_time(job.id).await.unwrap(),
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap())
    );
    assert_eq!(
        scheduling.previous_execution_time(job.id).await.unwrap(),
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap())
    );

    assert_eq!(scheduling.pause_job(job.id).await.unwrap(), 2);
    assert!(!scheduling.is_job_scheduled(job.id).await.unwrap());
    assert!(scheduling.next_execution_time(job.id).await.unwrap().is_none());

    assert_eq!(scheduling.resume_job(job.id).await.unwrap(), 2);
    assert!(scheduling.unschedule_job(job.id, quarterly.id).await.unwrap());
    assert!(!scheduling.unschedule_job(job.id, quarterly.id).await.unwrap());
    assert_eq!(
        scheduling.next_execution_time(job.id).await.unwrap(),
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_next_fire_time_respects_schedule_timezone() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()));
    let engine = engine_with_clock(repos.clone(), clock);
    let scheduling = engine.scheduling();

    let job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();
    let shanghai_morning = scheduling
        .create_schedule(
            &ScheduleBuilder::new()
                .with_cron("0 0 9 * * *")
                .with_timezone("Asia/Shanghai")
                .build(),
        )
        .await
        .unwrap();
    scheduling.schedule_job(job.id, shanghai_morning.id).await.unwrap();

    // 09:00 Asia/Shanghai == 01:00 UTC
    assert_eq!(
        scheduling.next_execution_time(job.id).await.unwrap(),
        Some(Utc.with_ymd_and_hms(2024, 1, 15, 1, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_cancel_job_executions_cancels_every_open_execution() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let runner = Arc::new(MockRunner::new("mock").with_delay(Duration::from_secs(30)));
    let mut config = EngineConfig::with_freshness_window(3600);
    config.max_requeue_attempts = 100;
    config.requeue_delay_ms = 50;
    let engine = JobEngine::builder(repos.clone(), config)
        .with_runner("mock", runner)
        .build();
    let job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();

    let running = engine.trigger_job(job.id, serde_json::json!({}), None).await.unwrap();
    let engine_ref = engine.as_ref();
    assert!(
        TestEnv::wait_for(
            || async move {
                engine_ref
                    .get_execution_status(running)
                    .await
                    .map(|e| e.status == ExecutionStatus::Running)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        )
        .await
    );

    let waiting = engine.trigger_job(job.id, serde_json::json!({}), None).await.unwrap();

    assert_eq!(engine.scheduling().cancel_job_executions(job.id).await.unwrap(), 2);
    for id in [running, waiting] {
        let done = engine.wait_for_execution(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Cancelled);
    }
    assert_eq!(engine.scheduling().cancel_job_executions(job.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_trigger_source_fires_once_per_due_time() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap()));
    let job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();
    let schedule = repos
        .schedules
        .create_schedule(&ScheduleBuilder::new().with_cron("0 * * * * *").build())
        .await
        .unwrap();
    repos.schedules.link(job.id, schedule.id).await.unwrap();

    let source = CronTriggerSource::new(repos.schedules.clone(), clock.clone(), trigger_config(60));

    let signals = source.poll().await.unwrap();
    assert_eq!(
        signals,
        vec![TriggerSignal {
            job_id: job.id,
            schedule_id: schedule.id,
            fire_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }]
    );

    // 同一触发点不会重复投递
    assert!(source.poll().await.unwrap().is_empty());

    // 错过的多个触发点合并为最晚的一个
    clock.set(Utc.with_ymd_and_hms(2024, 5, 1, 12, 3, 30).unwrap());
    let signals = source.poll().await.unwrap();
    assert_eq!(signals.len(), 1);
    assert_eq!(
        signals[0].fire_time,
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 3, 0).unwrap()
    );

    let link = repos
        .schedules
        .get_link(job.id, schedule.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.last_fired_at, Some(signals[0].fire_time));
}

#[tokio::test]
async fn test_trigger_source_skips_paused_links_and_inactive_schedules() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap()));
    let paused_job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();
    let other_job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();
    let active = repos
        .schedules
        .create_schedule(&ScheduleBuilder::new().build())
        .await
        .unwrap();
    let inactive = repos
        .schedules
        .create_schedule(&ScheduleBuilder::new().inactive().build())
        .await
        .unwrap();
    repos.schedules.link(paused_job.id, active.id).await.unwrap();
    repos.schedules.set_links_active(paused_job.id, false).await.unwrap();
    repos.schedules.link(other_job.id, inactive.id).await.unwrap();

    let source = CronTriggerSource::new(repos.schedules.clone(), clock, trigger_config(60));
    assert!(source.poll().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dispatch_loop_submits_scheduled_executions() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let engine = JobEngine::builder(repos.clone(), EngineConfig::with_freshness_window(3600))
        .with_runner("mock", Arc::new(MockRunner::new("mock")))
        .build();
    let job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();
    let inactive = repos.jobs.create(&JobBuilder::new().inactive().build()).await.unwrap();

    let (sender, receiver) = mpsc::channel(8);
    let shutdown = CancellationToken::new();
    let dispatch = tokio::spawn(engine.clone().run_dispatch_loop(receiver, shutdown.clone()));

    for job_id in [inactive.id, job.id] {
        sender
            .send(TriggerSignal {
                job_id,
                schedule_id: 5,
                fire_time: Utc::now(),
            })
            .await
            .unwrap();
    }

    let engine_ref = engine.as_ref();
    let job_id = job.id;
    assert!(
        TestEnv::wait_for(
            || async move {
                engine_ref
                    .executions_for_job(job_id, 10)
                    .await
                    .map(|list| list.iter().any(|e| e.status == ExecutionStatus::Completed))
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
        )
        .await
    );

    let executions = engine.executions_for_job(job.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].schedule_id, Some(5));
    assert!(engine.executions_for_job(inactive.id, 10).await.unwrap().is_empty());

    shutdown.cancel();
    dispatch.await.unwrap();
}

#[tokio::test]
async fn test_deactivate_and_activate_job() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let engine = engine_with_clock(repos.clone(), Arc::new(ManualClock::starting_now()));
    let scheduling = engine.scheduling();

    let job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();
    let schedule = scheduling
        .create_schedule(&ScheduleBuilder::new().build())
        .await
        .unwrap();
    scheduling.schedule_job(job.id, schedule.id).await.unwrap();

    assert!(scheduling.deactivate_job(job.id).await.unwrap());
    let stored = repos.jobs.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Inactive);
    assert!(!scheduling.is_job_scheduled(job.id).await.unwrap());
    let link = repos.schedules.get_link(job.id, schedule.id).await.unwrap().unwrap();
    assert!(!link.is_active);
    assert!(matches!(
        engine.trigger_job(job.id, serde_json::json!({}), None).await,
        Err(SchedulerError::Rejected {
            reason: RejectReason::JobInactive,
            ..
        })
    ));

    assert!(scheduling.activate_job(job.id).await.unwrap());
    let stored = repos.jobs.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Active);
    assert!(scheduling.is_job_scheduled(job.id).await.unwrap());

    assert!(!scheduling.activate_job(999).await.unwrap());
    assert!(!scheduling.deactivate_job(999).await.unwrap());
}

#[tokio::test]
async fn test_scheduled_and_unscheduled_job_lists() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let engine = engine_with_clock(repos.clone(), Arc::new(ManualClock::starting_now()));
    let scheduling = engine.scheduling();
    let schedule = scheduling
        .create_schedule(&ScheduleBuilder::new().build())
        .await
        .unwrap();

    let linked = repos.jobs.create(&JobBuilder::new().with_name("linked").build()).await.unwrap();
    let paused = repos.jobs.create(&JobBuilder::new().with_name("paused").build()).await.unwrap();
    let older = repos.jobs.create(&JobBuilder::new().with_name("older").build()).await.unwrap();
    let newer = repos.jobs.create(&JobBuilder::new().with_name("newer").build()).await.unwrap();
    scheduling.schedule_job(linked.id, schedule.id).await.unwrap();
    scheduling.schedule_job(paused.id, schedule.id).await.unwrap();
    scheduling.pause_job(paused.id).await.unwrap();

    let scheduled: Vec<i64> = scheduling
        .scheduled_jobs()
        .await
        .unwrap()
        .iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(scheduled, vec![linked.id]);

    // 暂停的关联仍然算作已关联
    let unscheduled: Vec<i64> = scheduling
        .unscheduled_jobs()
        .await
        .unwrap()
        .iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(unscheduled, vec![newer.id, older.id]);
}

#[tokio::test]
async fn test_job_health_uses_last_seven_executions() {
    let store = Arc::new(InMemoryStore::new());
    let repos = store.repositories();
    let engine = engine_with_clock(repos.clone(), Arc::new(ManualClock::starting_now()));
    let job = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();
    let other = repos.jobs.create(&JobBuilder::new().build()).await.unwrap();
    let base = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    let at = |minute: i64| base + chrono::Duration::minutes(minute);

    assert!(engine.is_job_healthy(job.id).await.unwrap());

    for minute in 1..=4 {
        let completed = ExecutionBuilder::new(job.id)
            .created_at(at(minute))
            .completed_at(at(minute))
            .build();
        repos.executions.create(&completed).await.unwrap();
    }
    for minute in 5..=7 {
        let failed = ExecutionBuilder::new(job.id)
            .created_at(at(minute))
            .failed_at(at(minute), "boom")
            .build();
        repos.executions.create(&failed).await.unwrap();
    }
    // 其他任务的失败不影响
    for minute in 1..=5 {
        let failed = ExecutionBuilder::new(other.id)
            .created_at(at(minute))
            .failed_at(at(minute), "boom")
            .build();
        repos.executions.create(&failed).await.unwrap();
    }
    assert!(engine.is_job_healthy(job.id).await.unwrap());
    assert!(!engine.is_job_healthy(other.id).await.unwrap());

    let failed = ExecutionBuilder::new(job.id)
        .created_at(at(8))
        .failed_at(at(8), "boom")
        .build();
    repos.executions.create(&failed).await.unwrap();
    assert!(!engine.is_job_healthy(job.id).await.unwrap());

    // 更早的失败移出窗口
    for minute in 9..=12 {
        let completed = ExecutionBuilder::new(job.id)
            .created_at(at(minute))
            .completed_at(at(minute))
            .build();
        repos.executions.create(&completed).await.unwrap();
    }
    assert!(engine.is_job_healthy(job.id).await.unwrap());
    assert_eq!(HEALTH_SAMPLE_SIZE, 7);
}
