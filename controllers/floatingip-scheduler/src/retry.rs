//! Fixed-interval retry with a deadline.
//!
//! Several orchestrator calls retry on transient failures within a bounded
//! budget: node lookups poll every 100 ms for up to a minute, annotation
//! patches every 300 ms for up to 20 s. Anything still failing when the
//! budget runs out is handed to the resync tier.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Outcome of an exhausted or aborted retry loop.
#[derive(Debug)]
pub enum RetryError<E> {
    /// A non-retryable error stopped the loop.
    Terminal(E),
    /// The budget elapsed; carries the last error observed.
    Exhausted(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Terminal(e) | RetryError::Exhausted(e) => e,
        }
    }
}

/// Runs `op` every `interval` until it succeeds, fails a `retryable` check,
/// or `budget` elapses. The first attempt runs immediately.
pub async fn retry_within<T, E, F, Fut, P>(
    interval: Duration,
    budget: Duration,
    mut op: F,
    retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let deadline = Instant::now() + budget;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(RetryError::Terminal(e)),
            Err(e) => {
                if Instant::now() + interval > deadline {
                    return Err(RetryError::Exhausted(e));
                }
                sleep(interval).await;
            }
        }
    }
}
