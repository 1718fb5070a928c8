//! Retry policy for statements that hit a locked database

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{STORE_MAX_ATTEMPTS, STORE_RETRY_BASE_DELAY, STORE_RETRY_MAX_DELAY};
use crate::error::StoreError;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: STORE_MAX_ATTEMPTS,
            base_delay: STORE_RETRY_BASE_DELAY,
            max_delay: STORE_RETRY_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given zero-based failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let max_attempts = self.max_attempts.max(1);

        for attempt in 0..max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    if attempt + 1 == max_attempts {
                        return Err(StoreError::Contention {
                            what: what.to_string(),
                            attempts: max_attempts,
                            elapsed: started.elapsed(),
                            source: e,
                        });
                    }
                    let delay = self.delay(attempt);
                    debug!(
                        "{} hit lock contention (attempt {}), retrying in {:?}",
                        what,
                        attempt + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(StoreError::Database {
                        what: what.to_string(),
                        source: e,
                    });
                }
            }
        }

        unreachable!("retry loop always returns");
    }
}

/// Check if an error is transient lock contention
///
/// SQLite reports contention as SQLITE_BUSY (5) or SQLITE_LOCKED (6), plus
/// their extended codes for recovery and snapshot conflicts.
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            if let Some(code) = db.code()
                && matches!(code.as_ref(), "5" | "6" | "261" | "262" | "517")
            {
                return true;
            }
            let message = db.message().to_lowercase();
            message.contains("database is locked")
                || message.contains("database table is locked")
                || message.contains("busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}
