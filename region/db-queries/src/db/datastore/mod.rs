// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Primary control plane interface for database read and write operations

// Every operation that changes more than one row runs inside a single
// transaction through `transaction_retry_wrapper`. Functions that take a
// `conn: &async_bb8_diesel::Connection<DbConnection>` are building blocks for
// those transactions and never commit anything themselves; they return
// `TransactionError` so that serialization failures reach the retry loop
// intact. Functions that take only `&self` get their own connection.

use super::config::DatabaseConfig;
use super::config::DnsConfig;
use super::error::Error;
use super::error::InternalContext;
use super::error::TransactionError;
use super::locks;
use super::pool::DataStoreConnection;
use super::pool::DbConnection;
use super::pool::Pool;
use crate::transaction_retry::RetryHelper;
use async_bb8_diesel::AsyncSimpleConnection;
use slog::Logger;
use std::future::Future;

mod dns_publication;
mod dns_resource;
mod domain;
mod interface;
mod lease;
mod node;
#[cfg(any(test, feature = "testing"))]
pub mod pub_test_utils;
mod static_ip_address;
mod subnet;

pub use interface::InterfaceCreate;
pub use static_ip_address::StaticIpAddressCreate;

// Idempotent, so every region process runs it on startup.
const SCHEMA: &str = include_str!("../../../schema/dbinit.sql");

pub struct DataStore {
    log: Logger,
    pool: Pool,
    database_config: DatabaseConfig,
    dns_config: DnsConfig,
}

impl DataStore {
    pub fn new(
        log: &Logger,
        pool: Pool,
        database_config: DatabaseConfig,
        dns_config: DnsConfig,
    ) -> Self {
        DataStore {
            log: log.new(o!("component" => "datastore")),
            pool,
            database_config,
            dns_config,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn dns_config(&self) -> &DnsConfig {
        &self.dns_config
    }

    /// Returns a connection from the connection pool.
    pub async fn pool_connection(
        &self,
    ) -> Result<DataStoreConnection<'_>, Error> {
        Ok(self.pool.pool().get().await?)
    }

    /// Creates the schema if it is missing and populates the rows every
    /// region database needs: the default domain and the initial DNS
    /// publication.
    ///
    /// Safe to call any number of times, from any number of region
    /// processes at once.
    pub async fn initialize(&self) -> Result<(), Error> {
        let session = self.pool.claim().await?;
        let guard = locks::STARTUP.guard(session).await?;

        let conn = self.pool_connection().await?;
        conn.batch_execute_async(SCHEMA)
            .await
            .map_err(|e| Error::internal_error(&e.to_string()))
            .internal_context("applying database schema")?;

        self.transaction_retry_wrapper("initialize")
            .transaction(&conn, |conn| async move {
                let domain = self.domain_ensure_default(&conn).await?;
                let publication =
                    self.dns_publication_ensure_initial(&conn).await?;
                debug!(
                    &self.log,
                    "database initialized";
                    "default_domain" => &domain.name,
                    "serial" => publication.serial,
                );
                Ok(())
            })
            .await
            .internal_context("initializing region database")?;

        let mut session = guard.release().await?;
        session.close().await;
        info!(&self.log, "region database ready");
        Ok(())
    }

    /// Returns a helper that runs a closure in a transaction, retrying the
    /// whole closure when the transaction loses a serialization race.
    ///
    /// An error returned by the closure rolls the transaction back and is
    /// returned as-is; it is never retried.
    pub(crate) fn transaction_retry_wrapper(
        &self,
        name: &'static str,
    ) -> RetryHelper {
        RetryHelper::new(
            &self.log,
            name,
            self.database_config.max_transaction_attempts.max(1),
        )
    }

    /// Like [`DataStore::transaction_retry_wrapper`], on a pooled
    /// connection.
    pub(crate) async fn transaction<T, F, Fut>(
        &self,
        name: &'static str,
        f: F,
    ) -> Result<T, Error>
    where
        T: Send + 'static,
        F: Fn(async_bb8_diesel::Connection<DbConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, TransactionError>> + Send,
    {
        let conn = self.pool_connection().await?;
        self.transaction_retry_wrapper(name).transaction(&conn, f).await
    }
}
