//! The retry loop that drives the CA's asynchronous state machines:
//! challenge polling and certificate issuance.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::debug;

use crate::error::Result;

/// One outcome of polling a blocking producer.
pub enum RetryOutcome<T> {
    /// The CA returned a terminal value.
    Ready(T),
    /// The CA has nothing yet; wait the default interval and retry.
    Pending,
    /// The CA asked us to wait until a specific deadline before retrying.
    RetryAfter(Instant),
}

/// Default poll interval when the CA gives no retry-after hint.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3_000);

/// Repeatedly invokes `producer` (expected to run its own blocking I/O off
/// the critical scheduler, e.g. via `tokio::task::spawn_blocking`) until it
/// yields [`RetryOutcome::Ready`] or returns an error.
pub async fn fetch_with_retry<T, F, Fut>(mut producer: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RetryOutcome<T>>>,
{
    loop {
        match producer().await? {
            RetryOutcome::Ready(value) => return Ok(value),
            RetryOutcome::Pending => {
                debug!("fetch_with_retry: pending, waiting {:?}", DEFAULT_POLL_INTERVAL);
                sleep(DEFAULT_POLL_INTERVAL).await;
            }
            RetryOutcome::RetryAfter(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                debug!("fetch_with_retry: retry-after, waiting {:?}", wait);
                sleep(wait).await;
            }
        }
    }
}
