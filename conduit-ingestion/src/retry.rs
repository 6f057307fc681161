//! Small, composable retry budgets, one per scope, per DESIGN NOTES §9:
//! "Express these as nested small functions, each with its own budget,
//! rather than one monolithic retry."

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retries `op` up to `attempts` times total, sleeping `delays[i]` before
/// attempt `i+2` (the first attempt has no delay). `should_retry` decides
/// whether a given error is worth retrying at all (e.g. a 4xx should not
/// be retried per spec.md §4.2's failure policy).
pub async fn retry_with_backoff<T, E, Fut, F, R>(
    attempts: usize,
    delays: &[Duration],
    mut op: F,
    should_retry: R,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = should_retry(&err);
                warn!(attempt = attempt + 1, %err, retryable, "operation failed");
                if !retryable || attempt + 1 == attempts {
                    last_err = Some(err);
                    break;
                }
                if let Some(delay) = delays.get(attempt) {
                    tokio::time::sleep(*delay).await;
                }
                last_err = Some(err);
            }
        }
    }
    Err(last_err.expect("retry loop always records the last error before exiting"))
}

/// The source-side batch/API retry budget from spec.md §4.2: the initial
/// attempt plus three retries, backing off 2s/4s/6s between them.
pub const SOURCE_API_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(6),
];
pub const SOURCE_API_ATTEMPTS: usize = 4;
