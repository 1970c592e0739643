// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polling for a condition that another task is expected to bring about.

use futures::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Result of one check of the condition passed to [`wait_for_condition()`]
#[derive(Debug, Error)]
pub enum CondCheckError<E> {
    /// the condition does not hold yet; keep polling
    #[error("poll condition not yet ready")]
    NotYet,
    /// the condition can never hold; stop polling
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

/// Error returned by [`wait_for_condition()`]
#[derive(Debug, Error)]
pub enum Error<E> {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(E),
}

/// Poll `cond` every `poll_interval` until it reports success, reports a
/// permanent failure, or `poll_max` has elapsed.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        match cond().await {
            Ok(output) => return Ok(output),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => (),
        }

        tokio::time::sleep(*poll_interval).await;
    }
}
