//! Deadline for calls into a counting backend.

use crate::error::{ConfigError, StoreError};
use std::future::Future;
use std::time::{Duration, Instant};

/// Bounds a single store operation. Expiry is reported as [`StoreError::Timeout`], which the
/// failover store treats like any other outage.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Errors if duration is zero or `Duration::MAX`.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration == Duration::ZERO || duration == Duration::MAX {
            return Err(ConfigError::InvalidTimeout { name: "timeout", value: duration });
        }
        Ok(Self { duration })
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `operation`, abandoning it once the deadline passes. Dropping the inner future
    /// cancels it, so a timed-out call leaves nothing running.
    pub async fn execute<T, Fut>(&self, operation: &'static str, fut: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, fut).await {
            Ok(result) => result,
            Err(_) => {
                Err(StoreError::Timeout { operation, elapsed: start.elapsed(), limit: self.duration })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_and_unbounded_durations() {
        assert!(TimeoutPolicy::new(Duration::ZERO).is_err());
        assert!(TimeoutPolicy::new(Duration::MAX).is_err());
        assert_eq!(
            TimeoutPolicy::new(Duration::from_millis(40)).unwrap().duration(),
            Duration::from_millis(40)
        );
    }

    #[tokio::test]
    async fn completes_before_timeout() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(100)).unwrap();
        let result = timeout
            .execute("increment", async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, StoreError>(7)
            })
            .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_becomes_timeout_error() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(50)).unwrap();
        let result = timeout
            .execute("increment", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StoreError>(())
            })
            .await;

        match result.unwrap_err() {
            StoreError::Timeout { operation, limit, .. } => {
                assert_eq!(operation, "increment");
                assert_eq!(limit, Duration::from_millis(50));
            }
            e => panic!("expected Timeout, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn propagates_store_errors_unchanged() {
        let timeout = TimeoutPolicy::new(Duration::from_secs(1)).unwrap();
        let result = timeout
            .execute("peek", async { Err::<(), _>(StoreError::unavailable("redis", "refused")) })
            .await;
        assert_eq!(result.unwrap_err(), StoreError::unavailable("redis", "refused"));
    }
}
