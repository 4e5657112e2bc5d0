//! Test doubles for the domain ports
//!
//! The runner, notifier and lock doubles record what the execution core did
//! to them so tests can assert on ordering and exclusivity. The execution
//! repository wrapper injects storage outages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobsched_domain::{
    Execution, ExecutionLock, ExecutionRepository, ExecutionStatus, JobExecutionSummary,
    JobRunner, LockRepository, NotificationDispatcher, RunContext,
};
use jobsched_errors::{SchedulerError, SchedulerResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// What a `MockRunner` does once its delay has elapsed
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Succeed(serde_json::Value),
    Fail(String),
    Panic(String),
}

/// Mock implementation of JobRunner for testing
pub struct MockRunner {
    name: String,
    behavior: Mutex<MockBehavior>,
    delay: Mutex<Duration>,
    ignore_cancellation: AtomicBool,
    invocations: AtomicUsize,
    running: Mutex<HashMap<i64, usize>>,
    max_running: Mutex<HashMap<i64, usize>>,
    contexts: Mutex<Vec<RunContext>>,
}

impl MockRunner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            behavior: Mutex::new(MockBehavior::Succeed(serde_json::json!({"ok": true}))),
            delay: Mutex::new(Duration::ZERO),
            ignore_cancellation: AtomicBool::new(false),
            invocations: AtomicUsize::new(0),
            running: Mutex::new(HashMap::new()),
            max_running: Mutex::new(HashMap::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(name: &str, result: serde_json::Value) -> Self {
        let runner = Self::new(name);
        runner.set_behavior(MockBehavior::Succeed(result));
        runner
    }

    pub fn failing(name: &str, message: &str) -> Self {
        let runner = Self::new(name);
        runner.set_behavior(MockBehavior::Fail(message.to_string()));
        runner
    }

    pub fn panicking(name: &str, message: &str) -> Self {
        let runner = Self::new(name);
        runner.set_behavior(MockBehavior::Panic(message.to_string()));
        runner
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = delay;
        self
    }

    /// Keep sleeping through cancellation, like a runner that does not poll its token
    pub fn ignoring_cancellation(self) -> Self {
        self.ignore_cancellation.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous runs observed for one job
    pub fn max_concurrent(&self, job_id: i64) -> usize {
        self.max_running
            .lock()
            .unwrap()
            .get(&job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn currently_running(&self, job_id: i64) -> usize {
        self.running.lock().unwrap().get(&job_id).copied().unwrap_or(0)
    }

    pub fn contexts(&self) -> Vec<RunContext> {
        self.contexts.lock().unwrap().clone()
    }

    fn enter(&self, job_id: i64) {
        let mut running = self.running.lock().unwrap();
        let current = running.entry(job_id).or_insert(0);
        *current += 1;
        let mut max = self.max_running.lock().unwrap();
        let peak = max.entry(job_id).or_insert(0);
        *peak = (*peak).max(*current);
    }

    fn exit(&self, job_id: i64) {
        if let Some(current) = self.running.lock().unwrap().get_mut(&job_id) {
            *current = current.saturating_sub(1);
        }
    }
}

#[async_trait]
impl JobRunner for MockRunner {
    async fn run(&self, ctx: RunContext) -> SchedulerResult<serde_json::Value> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(ctx.clone());
        let job_id = ctx.job.id;
        self.enter(job_id);

        let delay = *self.delay.lock().unwrap();
        let cancelled = if self.ignore_cancellation.load(Ordering::SeqCst) {
            tokio::time::sleep(delay).await;
            false
        } else {
            tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = ctx.cancellation.cancelled() => true,
            }
        };

        self.exit(job_id);

        if cancelled {
            return Err(SchedulerError::RunnerFailure("cancelled".to_string()));
        }

        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            MockBehavior::Succeed(value) => Ok(value),
            MockBehavior::Fail(message) => Err(SchedulerError::RunnerFailure(message)),
            MockBehavior::Panic(message) => panic!("{}", message),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Notification dispatcher that keeps every terminal notification
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    notifications: Arc<Mutex<Vec<(Uuid, ExecutionStatus)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(Uuid, ExecutionStatus)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn count_for(&self, execution_id: Uuid) -> usize {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == execution_id)
            .count()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn notify(&self, execution: &Execution, status: ExecutionStatus) -> SchedulerResult<()> {
        self.notifications
            .lock()
            .unwrap()
            .push((execution.execution_id, status));
        Ok(())
    }
}

/// One entry of the lock holder log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Acquired { job_id: i64, holder: String },
    Denied { job_id: i64, holder: String },
    Released { job_id: i64, holder: String },
    ReleaseMismatch { job_id: i64, holder: String },
}

/// Lock repository wrapper that logs every acquisition and release
pub struct RecordingLockRepository {
    inner: Arc<dyn LockRepository>,
    events: Mutex<Vec<LockEvent>>,
}

impl RecordingLockRepository {
    pub fn new(inner: Arc<dyn LockRepository>) -> Self {
        Self {
            inner,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<LockEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Number of successful releases made by `holder`
    pub fn releases_by(&self, holder: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, LockEvent::Released { holder: h, .. } if h == holder))
            .count()
    }

    /// Replays the log and returns the largest number of simultaneous holders per job
    pub fn max_simultaneous_holders(&self, job_id: i64) -> usize {
        let mut held = 0usize;
        let mut peak = 0usize;
        for event in self.events.lock().unwrap().iter() {
            match event {
                LockEvent::Acquired { job_id: j, .. } if *j == job_id => {
                    held += 1;
                    peak = peak.max(held);
                }
                LockEvent::Released { job_id: j, .. } if *j == job_id => {
                    held = held.saturating_sub(1);
                }
                _ => {}
            }
        }
        peak
    }
}

#[async_trait]
impl LockRepository for RecordingLockRepository {
    async fn try_acquire(&self, lock: &ExecutionLock) -> SchedulerResult<bool> {
        let acquired = self.inner.try_acquire(lock).await?;
        let event = if acquired {
            LockEvent::Acquired {
                job_id: lock.job_id,
                holder: lock.lock_holder.clone(),
            }
        } else {
            LockEvent::Denied {
                job_id: lock.job_id,
                holder: lock.lock_holder.clone(),
            }
        };
        self.events.lock().unwrap().push(event);
        Ok(acquired)
    }

    async fn release(&self, job_id: i64, holder: &str) -> SchedulerResult<bool> {
        let released = self.inner.release(job_id, holder).await?;
        let holder = holder.to_string();
        let event = if released {
            LockEvent::Released { job_id, holder }
        } else {
            LockEvent::ReleaseMismatch { job_id, holder }
        };
        self.events.lock().unwrap().push(event);
        Ok(released)
    }

    async fn get(&self, job_id: i64) -> SchedulerResult<Option<ExecutionLock>> {
        self.inner.get(job_id).await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        self.inner.delete_expired(now).await
    }
}

/// Execution repository wrapper that fails selected operations on demand
pub struct FailingExecutionRepository {
    inner: Arc<dyn ExecutionRepository>,
    fail_create: AtomicBool,
    fail_reads: AtomicBool,
    fail_updates_to: Mutex<Vec<ExecutionStatus>>,
}

impl FailingExecutionRepository {
    pub fn new(inner: Arc<dyn ExecutionRepository>) -> Self {
        Self {
            inner,
            fail_create: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_updates_to: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Fails history lookups such as `most_recent_terminal`
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fails conditional updates that would move an execution into `status`
    pub fn fail_updates_to(&self, status: ExecutionStatus) {
        self.fail_updates_to.lock().unwrap().push(status);
    }

    pub fn heal(&self) {
        self.fail_create.store(false, Ordering::SeqCst);
        self.fail_reads.store(false, Ordering::SeqCst);
        self.fail_updates_to.lock().unwrap().clear();
    }

    fn outage(operation: &str) -> SchedulerError {
        SchedulerError::database_error(format!("模拟存储故障: {}", operation))
    }

    fn check_reads(&self, operation: &str) -> SchedulerResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::outage(operation));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionRepository for FailingExecutionRepository {
    async fn create(&self, execution: &Execution) -> SchedulerResult<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Self::outage("create"));
        }
        self.inner.create(execution).await
    }

    async fn get(&self, execution_id: Uuid) -> SchedulerResult<Option<Execution>> {
        self.inner.get(execution_id).await
    }

    async fn update_if_status(
        &self,
        execution: &Execution,
        expected: &[ExecutionStatus],
    ) -> SchedulerResult<bool> {
        if self
            .fail_updates_to
            .lock()
            .unwrap()
            .contains(&execution.status)
        {
            return Err(Self::outage("update_if_status"));
        }
        self.inner.update_if_status(execution, expected).await
    }

    async fn most_recent_terminal(
        &self,
        job_id: i64,
        since: DateTime<Utc>,
    ) -> SchedulerResult<Option<Execution>> {
        self.check_reads("most_recent_terminal")?;
        self.inner.most_recent_terminal(job_id, since).await
    }

    async fn find_by_job(&self, job_id: i64, limit: i64) -> SchedulerResult<Vec<Execution>> {
        self.check_reads("find_by_job")?;
        self.inner.find_by_job(job_id, limit).await
    }

    async fn find_by_status(&self, status: ExecutionStatus) -> SchedulerResult<Vec<Execution>> {
        self.check_reads("find_by_status")?;
        self.inner.find_by_status(status).await
    }

    async fn find_recent(&self, limit: i64) -> SchedulerResult<Vec<Execution>> {
        self.check_reads("find_recent")?;
        self.inner.find_recent(limit).await
    }

    async fn find_non_terminal(&self, job_id: i64) -> SchedulerResult<Vec<Execution>> {
        self.check_reads("find_non_terminal")?;
        self.inner.find_non_terminal(job_id).await
    }

    async fn find_terminal_between(
        &self,
        job_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Execution>> {
        self.check_reads("find_terminal_between")?;
        self.inner.find_terminal_between(job_id, from, to).await
    }

    async fn summary(&self, job_id: i64) -> SchedulerResult<JobExecutionSummary> {
        self.check_reads("summary")?;
        self.inner.summary(job_id).await
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64> {
        self.inner.delete_terminal_before(cutoff).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobsched_domain::Job;
    use tokio_util::sync::CancellationToken;

    fn context(job_id: i64) -> RunContext {
        let mut job = Job::new("overlap", "mock");
        job.id = job_id;
        RunContext {
            execution_id: Uuid::new_v4(),
            job,
            parameters: serde_json::json!({}),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_runner_counts_overlap() {
        let runner = Arc::new(MockRunner::new("mock").with_delay(Duration::from_millis(50)));
        let a = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(context(1)).await }
        });
        let b = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(context(1)).await }
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(runner.invocations(), 2);
        assert_eq!(runner.max_concurrent(1), 2);
        assert_eq!(runner.currently_running(1), 0);
    }

    #[tokio::test]
    async fn test_mock_runner_observes_cancellation() {
        let runner = MockRunner::new("mock").with_delay(Duration::from_secs(30));
        let ctx = context(1);
        ctx.cancellation.cancel();
        let result = runner.run(ctx).await;
        assert!(matches!(result, Err(SchedulerError::RunnerFailure(_))));
    }

    #[tokio::test]
    async fn test_mock_runner_failure() {
        let runner = MockRunner::failing("mock", "boom");
        let err = runner.run(context(2)).await.unwrap_err();
        assert_eq!(err.to_string(), "任务执行失败: boom");
    }
}
