//! Backoff schedules for tunnel reconnects and coordinator calls
//!
//! [`Backoff`] is the deterministic doubling schedule every tunnel session
//! uses between reconnect attempts. [`retry_with_backoff`] wraps one-shot
//! coordinator calls (cluster listing, best-effort deletes) with the same
//! schedule plus jitter so a restart of thousands of clusters does not hit
//! the coordinator in lockstep.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::{Error, Result};

/// First delay after a failed tunnel attempt
pub const TUNNEL_BACKOFF_FLOOR: Duration = Duration::from_secs(1);

/// Maximum delay between tunnel attempts
pub const TUNNEL_BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Doubling backoff bounded by a floor and a ceiling
///
/// Successive calls to [`Backoff::next_delay`] return non-decreasing values
/// that never exceed the ceiling. [`Backoff::reset`] returns the schedule to
/// the floor after a successful connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a schedule starting at `floor` and capped at `ceiling`
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Schedule used by tunnel sessions: 1s doubling to 30s
    pub fn tunnel() -> Self {
        Self::new(TUNNEL_BACKOFF_FLOOR, TUNNEL_BACKOFF_CEILING)
    }

    /// Delay to sleep before the next attempt, advancing the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.ceiling);
        delay
    }

    /// Delay the next call to [`Backoff::next_delay`] will return
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return to the floor
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::tunnel()
    }
}

/// Configuration for coordinator calls that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: TUNNEL_BACKOFF_FLOOR,
            max_delay: TUNNEL_BACKOFF_CEILING,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation, retrying failures with jittered backoff
///
/// Returns the last error once `max_attempts` is exhausted. Errors that are
/// not [`Error::is_retryable`] are returned on the first occurrence.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut backoff = Backoff::new(config.initial_delay, config.max_delay);

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !err.is_retryable() {
            warn!(operation = %operation_name, attempt, error = %err, "Operation failed permanently");
            return Err(err);
        }

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(err);
        }

        // 0.5x to 1.5x of the scheduled delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(backoff.next_delay().as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_tunnel_backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::tunnel();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    /// Story: delays never shrink and never pass the ceiling, and a
    /// successful connect drops the schedule back to the floor
    #[test]
    fn story_backoff_is_monotonic_bounded_and_resets() {
        let mut backoff = Backoff::tunnel();
        let mut previous = Duration::ZERO;

        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= TUNNEL_BACKOFF_CEILING);
            previous = delay;
        }
        assert_eq!(previous, TUNNEL_BACKOFF_CEILING);

        backoff.reset();
        assert_eq!(backoff.current(), TUNNEL_BACKOFF_FLOOR);
        assert_eq!(backoff.next_delay(), TUNNEL_BACKOFF_FLOOR);
    }

    #[test]
    fn test_ceiling_below_floor_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    /// Story: a coordinator delete that answers 503 twice goes through on
    /// the third call, after two jittered waits of roughly 1s and 2s
    #[tokio::test(start_paused = true)]
    async fn story_transient_coordinator_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let started = tokio::time::Instant::now();

        let result = retry_with_backoff(
            &RetryConfig::with_max_attempts(3),
            "delete_cluster",
            || {
                let seen = seen.clone();
                async move {
                    match seen.fetch_add(1, Ordering::SeqCst) {
                        0 | 1 => Err(Error::coordinator_status(503, "unavailable")),
                        _ => Ok("c-abc"),
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "c-abc");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // 1s and 2s scaled by 0.5..1.5
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(1500), "{waited:?}");
        assert!(waited <= Duration::from_millis(4500), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let result: Result<()> = retry_with_backoff(
            &RetryConfig::with_max_attempts(3),
            "delete_cluster",
            || {
                let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(Error::coordinator(format!("attempt {attempt} refused"))) }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("attempt 3 refused"), "{err}");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let result: Result<()> = retry_with_backoff(
            &RetryConfig::with_max_attempts(3),
            "delete_cluster",
            || {
                seen.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::validation("cluster id is empty")) }
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_success_does_not_sleep() {
        let started = std::time::Instant::now();
        let result: Result<u16> =
            retry_with_backoff(&RetryConfig::with_max_attempts(3), "list_clusters", || async {
                Ok(200)
            })
            .await;
        assert_eq!(result.unwrap(), 200);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
