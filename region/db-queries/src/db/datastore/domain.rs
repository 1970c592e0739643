// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`Domain`]s.

use super::DataStore;
use crate::db::error::public_error_from_diesel;
use crate::db::error::Error;
use crate::db::error::ErrorHandler;
use crate::db::error::InternalContext;
use crate::db::error::LookupResult;
use crate::db::error::ResourceType;
use crate::db::error::TransactionError;
use crate::db::error::UpdateResult;
use crate::db::model::Domain;
use crate::db::model::DomainId;
use crate::db::pool::DbConnection;
use crate::db::schema::domain::dsl;
use async_bb8_diesel::AsyncRunQueryDsl;
use diesel::prelude::*;

impl DataStore {
    /// Returns the default domain, creating it from configuration if the
    /// database has none yet.
    pub(super) async fn domain_ensure_default(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
    ) -> Result<Domain, TransactionError> {
        let existing = dsl::domain
            .filter(dsl::is_default.eq(true))
            .select(Domain::as_select())
            .first_async(conn)
            .await
            .optional()?;
        if let Some(domain) = existing {
            return Ok(domain);
        }
        let name = self.dns_config.default_domain.clone();
        let domain = diesel::insert_into(dsl::domain)
            .values((dsl::name.eq(name.clone()), dsl::is_default.eq(true)))
            .returning(Domain::as_returning())
            .get_result_async(conn)
            .await
            .map_err(|e| {
                TransactionError::from_diesel(
                    e,
                    ErrorHandler::Conflict(ResourceType::Domain, &name),
                )
            })?;
        info!(&self.log, "created default domain"; "domain" => &domain.name);
        Ok(domain)
    }

    /// The zone dynamic hostnames are published in.
    pub async fn domain_fetch_default(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
    ) -> Result<Domain, TransactionError> {
        let mut defaults: Vec<Domain> = dsl::domain
            .filter(dsl::is_default.eq(true))
            .select(Domain::as_select())
            .limit(2)
            .load_async(conn)
            .await?;
        let domain = match (defaults.pop(), defaults.pop()) {
            (Some(domain), None) => Ok(domain),
            (None, _) => Err(Error::internal_error(
                "no default domain; the database is not initialized",
            )),
            (Some(_), Some(_)) => {
                Err(Error::internal_error("found more than one default domain"))
            }
        };
        Ok(domain.internal_context("looking up the default domain")?)
    }

    pub async fn domain_default(&self) -> LookupResult<Domain> {
        let conn = self.pool_connection().await?;
        Ok(self.domain_fetch_default(&conn).await?)
    }

    /// Sets the TTL of records in `domain_id` that do not set their own.
    pub async fn domain_set_ttl(
        &self,
        domain_id: DomainId,
        ttl: Option<u32>,
    ) -> UpdateResult<Domain> {
        let ttl = ttl
            .map(i32::try_from)
            .transpose()
            .map_err(|_| Error::invalid_request("TTL is out of range"))?;
        let conn = self.pool_connection().await?;
        let lookup = domain_id.to_string();
        diesel::update(dsl::domain)
            .filter(dsl::id.eq(domain_id))
            .set(dsl::ttl.eq(ttl))
            .returning(Domain::as_returning())
            .get_result_async(&*conn)
            .await
            .map_err(|e| {
                public_error_from_diesel(
                    e,
                    ErrorHandler::NotFound(ResourceType::Domain, &lookup),
                )
            })
    }
}
