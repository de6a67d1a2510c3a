//! Backoff for pushes that lose a race or a connection.
//!
//! A push is retried as a whole: its transaction was rolled back, so the next
//! attempt reads the new stream heads and assigns fresh sequences.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::PostgresError;

/// Unique index on the predecessor of every event of a stream. Two pushes
/// racing for the same aggregate collide here.
const STREAM_PREVIOUS_INDEX: &str = "events_stream_previous_idx";

/// How often and how patiently a push is repeated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryStrategy {
    /// Attempts including the first one.
    pub attempts: u32,
    /// Wait before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound of a single wait.
    pub max_backoff: Duration,
    /// Growth of the wait per retry.
    pub multiplier: f64,
    /// Spread waits by ±20 %.
    pub jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryStrategy {
    /// Single attempt, failures surface immediately.
    pub const fn none() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let Some(exponent) = retry.checked_sub(1) else {
            return Duration::ZERO;
        };
        let factor = self
            .multiplier
            .powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let wait = self
            .initial_backoff
            .mul_f64(factor.min(1e6))
            .min(self.max_backoff);
        if self.jitter {
            wait.mul_f64(rand::rng().random_range(0.8..1.2))
        } else {
            wait
        }
    }
}

/// Whether repeating the failed operation may succeed.
pub fn is_transient(error: &PostgresError) -> bool {
    match error {
        PostgresError::ConnectionFailed(source) | PostgresError::Database { source, .. } => {
            is_transient_sqlx(source)
        }
        PostgresError::Migration(_) | PostgresError::Eventstore(_) => false,
    }
}

fn is_transient_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) if db.constraint() == Some(STREAM_PREVIOUS_INDEX) => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            // serialization failure, deadlock, too many connections, connection exceptions
            matches!(code.as_ref(), "40001" | "40P01" | "53300") || code.starts_with("08")
        }),
        _ => false,
    }
}

/// Runs `operation` until it succeeds, fails permanently or the attempts of
/// `strategy` are used up. The last error is returned.
pub async fn with_retries<F, Fut, T>(
    strategy: &RetryStrategy,
    operation: &str,
    mut run: F,
) -> Result<T, PostgresError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PostgresError>>,
{
    let attempts = strategy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match run().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "[postgres.retry] succeeded after retrying");
                }
                return Ok(value);
            }
            Err(error) => error,
        };
        if !is_transient(&error) {
            return Err(error);
        }
        if attempt >= attempts {
            warn!(operation, attempts, %error, "[postgres.retry] giving up");
            return Err(error);
        }
        let wait = strategy.backoff(attempt);
        debug!(operation, attempt, ?wait, %error, "[postgres.retry] transient failure");
        tokio::time::sleep(wait).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore::EventstoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> RetryStrategy {
        RetryStrategy {
            attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn pool_timeout() -> PostgresError {
        PostgresError::database("push")(sqlx::Error::PoolTimedOut)
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let strategy = RetryStrategy {
            jitter: false,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(150),
            ..RetryStrategy::default()
        };
        let waits: Vec<_> = (0..=4).map(|retry| strategy.backoff(retry)).collect();
        assert_eq!(
            waits,
            [0, 50, 100, 150, 150].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn jittered_backoff_stays_near_the_base() {
        let strategy = RetryStrategy {
            initial_backoff: Duration::from_millis(100),
            ..RetryStrategy::default()
        };
        for _ in 0..32 {
            let wait = strategy.backoff(1);
            assert!((80..=120).contains(&wait.as_millis()), "{wait:?}");
        }
    }

    #[tokio::test]
    async fn transient_failures_are_repeated() {
        let calls = &AtomicU32::new(0);
        let result = with_retries(&quick(3), "push", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(pool_timeout())
            } else {
                Ok("stored")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn last_error_is_returned_when_attempts_run_out() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&quick(4), "push", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(pool_timeout())
        })
        .await;

        assert!(matches!(
            result,
            Err(PostgresError::Database {
                operation: "push",
                ..
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn constraint_violations_fail_at_once() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = with_retries(&quick(4), "push", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PostgresError::Eventstore(EventstoreError::AlreadyExists(
                "username taken".into(),
            )))
        })
        .await;

        assert!(matches!(
            result,
            Err(PostgresError::Eventstore(EventstoreError::AlreadyExists(_)))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn classification() {
        assert!(is_transient(&pool_timeout()));
        assert!(is_transient(&PostgresError::ConnectionFailed(
            sqlx::Error::PoolClosed
        )));
        assert!(!is_transient(&PostgresError::database("filter")(
            sqlx::Error::RowNotFound
        )));
        assert!(!is_transient(&PostgresError::Eventstore(
            EventstoreError::invalid_argument("empty aggregate id")
        )));
    }
}
