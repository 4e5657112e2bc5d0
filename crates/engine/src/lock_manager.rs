use std::sync::Arc;

use tracing::{debug, instrument};

use jobsched_domain::{Clock, ExecutionLock, LockRepository};
use jobsched_errors::SchedulerResult;
use jobsched_infrastructure::{MetricsCollector, StructuredLogger};

/// 任务级排他执行锁
///
/// 获取由存储层的单次原子条件写完成；过期锁视为不存在，在获取时被覆盖。
pub struct LockManager {
    locks: Arc<dyn LockRepository>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsCollector>,
}

impl LockManager {
    pub fn new(
        locks: Arc<dyn LockRepository>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            locks,
            clock,
            metrics,
        }
    }

    #[instrument(skip(self))]
    pub async fn try_acquire(
        &self,
        job_id: i64,
        holder: &str,
        ttl: chrono::Duration,
    ) -> SchedulerResult<bool> {
        let lock = ExecutionLock::new(job_id, holder, self.clock.now(), ttl);
        let acquired = self.locks.try_acquire(&lock).await?;
        if acquired {
            self.metrics.record_lock_acquired();
            debug!("任务 {} 的执行锁由 {} 获得，过期时间 {}", job_id, holder, lock.expires_at);
        } else {
            self.metrics.record_lock_contention();
        }
        Ok(acquired)
    }

    /// 仅持有者可释放；持有者不匹配时不做任何修改并返回 false
    #[instrument(skip(self))]
    pub async fn release(&self, job_id: i64, holder: &str) -> SchedulerResult<bool> {
        let released = self.locks.release(job_id, holder).await?;
        if released {
            debug!("任务 {} 的执行锁已由 {} 释放", job_id, holder);
        }
        Ok(released)
    }

    pub async fn is_held(&self, job_id: i64) -> SchedulerResult<bool> {
        Ok(self.current(job_id).await?.is_some())
    }

    /// 当前有效的锁
    pub async fn current(&self, job_id: i64) -> SchedulerResult<Option<ExecutionLock>> {
        let now = self.clock.now();
        Ok(self
            .locks
            .get(job_id)
            .await?
            .filter(|lock| lock.is_live(now)))
    }

    pub async fn sweep_expired(&self) -> SchedulerResult<u64> {
        let removed = self.locks.delete_expired(self.clock.now()).await?;
        if removed > 0 {
            StructuredLogger::log_lock_swept(removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobsched_infrastructure::InMemoryStore;
    use jobsched_testing_utils::ManualClock;

    fn manager() -> (LockManager, Arc<ManualClock>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let manager = LockManager::new(
            store.repositories().locks,
            clock.clone(),
            Arc::new(MetricsCollector::new()),
        );
        (manager, clock)
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let (manager, clock) = manager();
        let ttl = Duration::seconds(5);

        assert!(manager.try_acquire(1, "h1", ttl).await.unwrap());
        assert!(manager.is_held(1).await.unwrap());
        assert!(!manager.try_acquire(1, "h2", ttl).await.unwrap());

        clock.advance_secs(6);
        assert!(!manager.is_held(1).await.unwrap());
        assert!(manager.try_acquire(1, "h2", ttl).await.unwrap());
        assert_eq!(
            manager.current(1).await.unwrap().unwrap().lock_holder,
            "h2"
        );
    }

    #[tokio::test]
    async fn test_release_requires_matching_holder() {
        let (manager, _clock) = manager();
        manager
            .try_acquire(7, "owner", Duration::seconds(30))
            .await
            .unwrap();

        assert!(!manager.release(7, "intruder").await.unwrap());
        assert!(manager.is_held(7).await.unwrap());
        assert!(manager.release(7, "owner").await.unwrap());
        assert!(!manager.is_held(7).await.unwrap());
        assert!(!manager.release(7, "owner").await.unwrap());
    }

    #[tokio::test]
    async fn test_locks_are_per_job() {
        let (manager, _clock) = manager();
        let ttl = Duration::seconds(30);
        assert!(manager.try_acquire(1, "a", ttl).await.unwrap());
        assert!(manager.try_acquire(2, "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let (manager, clock) = manager();
        manager
            .try_acquire(1, "a", Duration::seconds(1))
            .await
            .unwrap();
        manager
            .try_acquire(2, "b", Duration::seconds(60))
            .await
            .unwrap();
        clock.advance_secs(2);
        assert_eq!(manager.sweep_expired().await.unwrap(), 1);
        assert!(manager.is_held(2).await.unwrap());
    }
}
