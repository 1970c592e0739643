// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`Node`]s.

use super::DataStore;
use crate::db::error::public_error_from_diesel;
use crate::db::error::CreateResult;
use crate::db::error::Error;
use crate::db::error::ErrorHandler;
use crate::db::error::LookupResult;
use crate::db::error::ResourceType;
use crate::db::error::TransactionError;
use crate::db::model::Node;
use crate::db::pool::DbConnection;
use crate::db::schema::node::dsl;
use async_bb8_diesel::AsyncRunQueryDsl;
use diesel::prelude::*;

impl DataStore {
    pub async fn node_create(&self, hostname: &str) -> CreateResult<Node> {
        let conn = self.pool_connection().await?;
        Ok(self.node_insert(&conn, hostname).await?)
    }

    pub async fn node_insert(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        hostname: &str,
    ) -> Result<Node, TransactionError> {
        if hostname.is_empty() {
            return Err(Error::invalid_request(
                "node hostname cannot be empty",
            )
            .into());
        }
        diesel::insert_into(dsl::node)
            .values(dsl::hostname.eq(hostname.to_string()))
            .returning(Node::as_returning())
            .get_result_async(conn)
            .await
            .map_err(|e| {
                TransactionError::from_diesel(
                    e,
                    ErrorHandler::Conflict(ResourceType::Node, hostname),
                )
            })
    }

    /// Whether some node is already known by `hostname`.
    pub async fn node_hostname_exists(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        hostname: &str,
    ) -> Result<bool, TransactionError> {
        let exists = diesel::select(diesel::dsl::exists(
            dsl::node.filter(dsl::hostname.eq(hostname.to_string())),
        ))
        .get_result_async(conn)
        .await?;
        Ok(exists)
    }

    pub async fn node_lookup_by_hostname(
        &self,
        hostname: &str,
    ) -> LookupResult<Node> {
        let conn = self.pool_connection().await?;
        dsl::node
            .filter(dsl::hostname.eq(hostname.to_string()))
            .select(Node::as_select())
            .get_result_async(&*conn)
            .await
            .map_err(|e| {
                public_error_from_diesel(
                    e,
                    ErrorHandler::NotFound(ResourceType::Node, hostname),
                )
            })
    }
}
