mod policy;

pub use policy::ReconnectPolicy;

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Metadata for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub delay: Duration,
}

/// Why a retry loop stopped without a success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The token fired while waiting.
    Cancelled,
    /// Every attempt failed; `last` is the final failure.
    Exhausted { attempts: u32, last: Option<E> },
}

/// Retry an async operation with backoff according to `policy`.
///
/// - Each attempt first waits `policy.backoff_delay(attempt)`; cancellation
///   during the wait ends the loop with [`RetryError::Cancelled`].
/// - `operation(attempt)` is called with a 1-based attempt number.
/// - `on_failure(info, &err)` is called after every failed attempt.
pub async fn retry_with_backoff<T, E, Op, Fut, OnFailure>(
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
    mut operation: Op,
    mut on_failure: OnFailure,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    OnFailure: FnMut(RetryAttempt, &E),
{
    let mut last = None;
    for attempt in 1..=policy.max_attempts {
        let delay = policy.backoff_delay(attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                on_failure(RetryAttempt { attempt, delay }, &err);
                last = Some(err);
            }
        }
    }
    Err(RetryError::Exhausted {
        attempts: policy.max_attempts,
        last,
    })
}
