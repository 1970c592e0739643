// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The DNS publication log.
//!
//! Every change to a published name appends one [`DnsPublication`] in the
//! same transaction as the change itself, so a rolled-back change publishes
//! nothing. The DNS writer consumes the log in serial order.

use super::DataStore;
use crate::db::error::ListResult;
use crate::db::error::LookupResult;
use crate::db::error::TransactionError;
use crate::db::model::DnsPublication;
use crate::db::model::DnsUpdate;
use crate::db::pool::DbConnection;
use crate::db::schema::dns_publication::dsl;
use async_bb8_diesel::AsyncRunQueryDsl;
use chrono::Utc;
use diesel::prelude::*;

const INITIAL_PUBLICATION_SOURCE: &str = "Initial publication";

impl DataStore {
    /// Appends a publication describing `update`.
    pub async fn dns_publication_record(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        source: String,
        update: &DnsUpdate,
    ) -> Result<DnsPublication, TransactionError> {
        self.dns_publication_append(conn, source, update.to_string()).await
    }

    pub(super) async fn dns_publication_ensure_initial(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
    ) -> Result<DnsPublication, TransactionError> {
        let first = dsl::dns_publication
            .order(dsl::serial)
            .select(DnsPublication::as_select())
            .first_async(conn)
            .await
            .optional()?;
        if let Some(first) = first {
            return Ok(first);
        }
        self.dns_publication_append(
            conn,
            INITIAL_PUBLICATION_SOURCE.to_string(),
            String::new(),
        )
        .await
    }

    // The serial is assigned by the database.
    async fn dns_publication_append(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        source: String,
        update: String,
    ) -> Result<DnsPublication, TransactionError> {
        let publication = diesel::insert_into(dsl::dns_publication)
            .values((
                dsl::created.eq(Utc::now()),
                dsl::source.eq(source),
                dsl::update.eq(update),
            ))
            .returning(DnsPublication::as_returning())
            .get_result_async(conn)
            .await?;
        debug!(
            &self.log,
            "dns publication";
            "serial" => publication.serial,
            "source" => &publication.source,
            "update" => &publication.update,
        );
        Ok(publication)
    }

    /// Publications with a serial greater than `serial`, oldest first.
    pub async fn dns_publications_since(
        &self,
        serial: i64,
    ) -> ListResult<DnsPublication> {
        let conn = self.pool_connection().await?;
        let publications = dsl::dns_publication
            .filter(dsl::serial.gt(serial))
            .order(dsl::serial)
            .select(DnsPublication::as_select())
            .load_async(&*conn)
            .await
            .map_err(TransactionError::from)?;
        Ok(publications)
    }

    pub async fn dns_publication_latest_serial(
        &self,
    ) -> LookupResult<Option<i64>> {
        let conn = self.pool_connection().await?;
        let serial = dsl::dns_publication
            .select(diesel::dsl::max(dsl::serial))
            .get_result_async(&*conn)
            .await
            .map_err(TransactionError::from)?;
        Ok(serial)
    }
}
