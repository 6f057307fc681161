//! Sink-side retry budget, mirroring `conduit_ingestion::retry` (DESIGN
//! NOTES §9: "a budget per scope, not one monolithic retry"). Kept as its
//! own small copy rather than a shared crate dependency — the two budgets
//! have different shapes (counts, delays) and neither sink nor source
//! needs to know the other's policy.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

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
                warn!(attempt = attempt + 1, %err, retryable, "sink operation failed");
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

/// Batch write retry budget from spec.md §4.3: three retries backing off
/// 3s/6s/9s, then the caller splits the batch down (1000 -> per-record).
pub const SINK_WRITE_DELAYS: [Duration; 3] = [
    Duration::from_secs(3),
    Duration::from_secs(6),
    Duration::from_secs(9),
];
pub const SINK_WRITE_ATTEMPTS: usize = 4;
