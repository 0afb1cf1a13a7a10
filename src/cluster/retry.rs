//! Backoff policies for operations against the cluster.
//!
//! Retries live at the client boundary as explicit named policies, not
//! hidden inside helpers. The main consumer is the publish path: after a
//! leader is elected there is a short window where leadership has not
//! propagated to every node, and publishes issued in that window fail with
//! `NoLeader`. The publish policy rides out that window; it does not mask
//! persistent unavailability.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Policy for client-facing publish/subscribe proposals.
///
/// Sized for the leadership-propagation window: moderate initial delay,
/// long enough max delay to survive an election, jitter against thundering
/// herds. `max_times` is overridden by the node's configured
/// `publish_retry_attempts`.
pub fn publish_policy(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(max_times)
        .with_jitter()
}

/// Policy for internal bookkeeping proposals (delivery cursors). Fewer
/// attempts: bookkeeping is best-effort and a failure only widens the
/// redelivery window.
pub fn bookkeeping_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(20))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::Retryable;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn publish_policy_retries_until_success() {
        let attempts = AtomicU32::new(0);

        let result = (|| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(crate::error::Error::NoLeader("foo".to_string()))
            } else {
                Ok(42u64)
            }
        })
        .retry(publish_policy(5))
        .when(|e| e.is_retriable())
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn publish_policy_does_not_retry_fatal_errors() {
        let attempts = AtomicU32::new(0);

        let result: Result<u64, _> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::Error::Config("bad".to_string()))
        })
        .retry(publish_policy(5))
        .when(|e| e.is_retriable())
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_policy_exhausts() {
        let attempts = AtomicU32::new(0);

        let result: Result<u64, _> = (|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::Error::NoLeader("foo".to_string()))
        })
        .retry(publish_policy(3))
        .when(|e| e.is_retriable())
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
