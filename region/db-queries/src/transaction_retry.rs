// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helper types for performing automatic transaction retries

use crate::db::error::Error;
use crate::db::error::TransactionError;
use crate::db::pool::DbConnection;
use async_bb8_diesel::AsyncConnection;
use async_bb8_diesel::AsyncSimpleConnection;
use chrono::Utc;
use rand::{thread_rng, Rng};
use slog::Logger;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

const MIN_RETRY_BACKOFF: Duration = Duration::from_millis(0);
const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(50);

// Every transaction runs at this level, so that a transaction that read
// something another one changed before committing fails with a
// serialization error instead of acting on stale data.
const SET_ISOLATION_LEVEL: &str =
    "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ";

struct RetryHelperInner {
    start: chrono::DateTime<Utc>,
    attempts: u32,
}

impl RetryHelperInner {
    fn new() -> Self {
        Self { start: Utc::now(), attempts: 1 }
    }

    fn tick(&mut self) -> Self {
        let start = self.start;
        let attempts = self.attempts;

        self.start = Utc::now();
        self.attempts += 1;

        Self { start, attempts }
    }
}

/// Helper utility for tracking retry attempts and latency.
/// Intended to be used from within `DataStore::transaction_retry_wrapper`.
pub(crate) struct RetryHelper {
    log: Logger,
    name: &'static str,
    max_attempts: u32,
    inner: Mutex<RetryHelperInner>,
}

impl RetryHelper {
    /// Creates a new RetryHelper, and starts a timer tracking the transaction
    /// duration.
    pub(crate) fn new(
        log: &Logger,
        name: &'static str,
        max_attempts: u32,
    ) -> Self {
        Self {
            log: log.new(o!("transaction" => name)),
            name,
            max_attempts,
            inner: Mutex::new(RetryHelperInner::new()),
        }
    }

    /// Number of attempts made so far, including the one in progress.
    pub(crate) fn attempts(&self) -> u32 {
        self.inner.lock().unwrap().attempts
    }

    // Called upon a serialization failure.
    //
    // This function:
    // - Logs the duration of the failed attempt
    // - Returns "false" without sleeping if the attempt budget is spent
    // - Otherwise performs a random (uniform) backoff (limited to less than
    //   50 ms) and returns "true"
    async fn retry_callback(&self) -> bool {
        let (start, attempt) = {
            let inner = self.inner.lock().unwrap();
            (inner.start, inner.attempts)
        };

        let latency = (Utc::now() - start)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        debug!(
            &self.log,
            "transaction attempt failed with a serialization conflict";
            "attempt" => attempt,
            "latency_secs" => latency,
        );

        if attempt >= self.max_attempts {
            warn!(&self.log, "giving up on transaction"; "attempts" => attempt);
            return false;
        }

        // This backoff is not exponential. Conflicts here come from two
        // writers touching the same rows at once, and a short random delay
        // is enough to let one of them through.
        let duration = {
            let mut rng = thread_rng();
            rng.gen_range(MIN_RETRY_BACKOFF..MAX_RETRY_BACKOFF)
        };
        tokio::time::sleep(duration).await;

        self.inner.lock().unwrap().tick();
        true
    }

    /// Runs `f` in a transaction on `conn`, running it again from the start
    /// each time it fails with a serialization conflict.
    ///
    /// `f` may therefore run several times, and must not have effects
    /// outside the transaction.
    pub(crate) async fn transaction<T, F, Fut>(
        self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        f: F,
    ) -> Result<T, Error>
    where
        T: Send + 'static,
        F: Fn(async_bb8_diesel::Connection<DbConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, TransactionError>> + Send,
    {
        let f = &f;
        loop {
            let result = conn
                .transaction_async(|conn| async move {
                    conn.batch_execute_async(SET_ISOLATION_LEVEL).await?;
                    f(conn).await
                })
                .await;
            match result {
                Ok(value) => return Ok(value),
                Err(error) if error.retryable() => {
                    if !self.retry_callback().await {
                        return Err(Error::TransactionConflict {
                            name: self.name.to_string(),
                            attempts: self.attempts(),
                        });
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}
