//! Reusable retry shell for database operations.
//!
//! Transient failures (locked database, connection trouble, timeouts) are
//! retried with exponential backoff and jitter; hard failures (missing file,
//! permission denied, malformed database) are returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{EngineError, Result};

/// Backoff parameters for [`with_retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Jitter proportion range; each delay is scaled by `1 ± r` with `r`
    /// drawn from this range.
    pub jitter: (f64, f64),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: (0.10, 0.30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (0-based), jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let mut rng = rand::rng();
        let proportion = rng.random_range(self.jitter.0..=self.jitter.1);
        let sign = if rng.random_bool(0.5) { 1.0 } else { -1.0 };
        Duration::from_secs_f64((capped * (1.0 + sign * proportion)).max(0.0))
    }
}

/// Whether a failed operation is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Hard,
}

/// Classify an engine error for the retry shell.
pub fn classify(error: &EngineError) -> FailureClass {
    match error {
        EngineError::Database(db_err) => classify_sqlx(db_err),
        EngineError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                FailureClass::Hard
            }
            _ => FailureClass::Transient,
        },
        _ => FailureClass::Hard,
    }
}

fn classify_sqlx(error: &sqlx::Error) -> FailureClass {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => FailureClass::Transient,
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            if message.contains("locked")
                || message.contains("busy")
                || message.contains("timeout")
                || message.contains("timed out")
            {
                FailureClass::Transient
            } else {
                FailureClass::Hard
            }
        }
        _ => FailureClass::Hard,
    }
}

/// Run `operation`, retrying transient failures per `policy`. Returns the
/// operation's value, or the last error once attempts are exhausted or a hard
/// failure is seen.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    source_id: &str,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                if class == FailureClass::Hard || attempt + 1 >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    source = source_id,
                    operation = operation_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient database error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(5),
            jitter: (0.10, 0.30),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), "src", "op", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(EngineError::Io(std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "flaky",
                    )))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hard_errors_bypass_retry() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_policy(), "src", "op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "gone",
                )))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_exhaust_to_last_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast_policy(), "src", "op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "still flaky",
                )))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delays_grow_and_stay_capped() {
        let policy = RetryPolicy::default();
        let first = policy.delay_for_attempt(0);
        assert!(first >= Duration::from_millis(700), "{first:?}");
        assert!(first <= Duration::from_millis(1300), "{first:?}");

        let late = policy.delay_for_attempt(10);
        assert!(late <= Duration::from_secs(39), "{late:?}");
    }
}
