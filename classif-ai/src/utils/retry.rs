//! Bounded exponential backoff
//!
//! Used where a row written by another connection may not be visible yet
//! (an inference request picked up right after it was enqueued) and for
//! transient SQLite lock errors.

use std::time::Duration;

use classif_common::{Error, Result};

/// Longest single sleep between attempts
const MAX_BACKOFF_MS: u64 = 1000;

/// Retry `operation` until it yields `Some`, up to `max_attempts` times
///
/// **Backoff:** `base_delay_ms`, doubling per attempt, capped at one second.
/// `Ok(None)` and "database is locked" errors are retried; any other error
/// is returned immediately. Exhaustion yields `Error::NotFound`.
pub async fn retry_until_visible<F, Fut, T>(
    operation_name: &str,
    max_attempts: u32,
    base_delay_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>>>,
{
    let mut backoff_ms = base_delay_ms.max(1);
    let max_attempts = max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation().await {
            Ok(Some(value)) => {
                if attempt > 1 {
                    tracing::debug!(operation = operation_name, attempt, "Visible after retry");
                }
                return Ok(value);
            }
            Ok(None) => {}
            Err(Error::Database(db_err)) if db_err.to_string().contains("database is locked") => {
                tracing::warn!(operation = operation_name, attempt, "Database locked, will retry");
            }
            Err(err) => return Err(err),
        }

        if attempt == max_attempts {
            break;
        }

        let sleep_ms = backoff_ms.min(MAX_BACKOFF_MS);
        tracing::debug!(
            operation = operation_name,
            attempt,
            backoff_ms = sleep_ms,
            "Not visible yet, backing off"
        );
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
    }

    tracing::error!(operation = operation_name, max_attempts, "Gave up waiting for visibility");
    Err(Error::NotFound(format!(
        "{}: not visible after {} attempts",
        operation_name, max_attempts
    )))
}
