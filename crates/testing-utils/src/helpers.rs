//! Test helper utilities and common testing patterns

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jobsched_domain::Clock;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(ChronoDuration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }

    /// Set up logging for tests (call once per test binary)
    pub fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance_secs(6);
        assert_eq!(clock.now(), start + ChronoDuration::seconds(6));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[tokio::test]
    async fn test_wait_for_success() {
        let counter = AtomicU32::new(0);
        let ok = TestEnv::wait_for(
            || {
                let value = counter.fetch_add(1, Ordering::SeqCst);
                async move { value >= 2 }
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_wait_for_timeout() {
        let ok = TestEnv::wait_for(|| async { false }, Duration::from_millis(60)).await;
        assert!(!ok);
    }
}
