// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`StaticIpAddress`]es.

use super::DataStore;
use crate::db::error::public_error_from_diesel;
use crate::db::error::CreateResult;
use crate::db::error::Error;
use crate::db::error::ErrorHandler;
use crate::db::error::ListResult;
use crate::db::error::LookupResult;
use crate::db::error::ResourceType;
use crate::db::error::TransactionError;
use crate::db::model::InterfaceId;
use crate::db::model::IpAddressType;
use crate::db::model::StaticIpAddress;
use crate::db::model::StaticIpAddressId;
use crate::db::model::SubnetId;
use crate::db::pool::DbConnection;
use crate::db::schema::interface;
use crate::db::schema::static_ip_address::dsl;
use async_bb8_diesel::AsyncRunQueryDsl;
use chrono::DateTime;
use chrono::Utc;
use diesel::prelude::*;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Parameters for a new address.
#[derive(Clone, Debug)]
pub struct StaticIpAddressCreate {
    pub ip: Option<IpAddr>,
    pub alloc_type: IpAddressType,
    pub subnet_id: Option<SubnetId>,
    pub lease_time: Option<i32>,
    /// Interfaces to link the new address to.
    pub interface_ids: Vec<InterfaceId>,
}

impl DataStore {
    pub async fn static_ip_address_create(
        &self,
        params: StaticIpAddressCreate,
    ) -> CreateResult<StaticIpAddress> {
        let params = &params;
        self.transaction("static_ip_address_create", |conn| async move {
            for interface_id in &params.interface_ids {
                let exists = diesel::select(diesel::dsl::exists(
                    interface::table.filter(interface::id.eq(*interface_id)),
                ))
                .get_result_async::<bool>(&conn)
                .await?;
                if !exists {
                    return Err(Error::not_found(
                        ResourceType::Interface,
                        interface_id,
                    )
                    .into());
                }
            }
            let sip = self
                .static_ip_address_insert(
                    &conn,
                    params.ip,
                    params.alloc_type,
                    params.subnet_id,
                    params.lease_time,
                    Utc::now(),
                )
                .await?;
            for interface_id in &params.interface_ids {
                self.interface_link_ip_address(&conn, *interface_id, sip.id)
                    .await?;
            }
            Ok(sip)
        })
        .await
    }

    /// Inserts an address with `created` and `updated` set to `timestamp`.
    pub async fn static_ip_address_insert(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        ip: Option<IpAddr>,
        alloc_type: IpAddressType,
        subnet_id: Option<SubnetId>,
        lease_time: Option<i32>,
        timestamp: DateTime<Utc>,
    ) -> Result<StaticIpAddress, TransactionError> {
        if let Some(subnet_id) = subnet_id {
            let subnet = self.subnet_fetch(conn, subnet_id).await?;
            if let Some(ip) = ip {
                if !subnet.contains(ip) {
                    return Err(Error::invalid_request(&format!(
                        "{} is not within subnet {}",
                        ip, subnet.cidr
                    ))
                    .into());
                }
            }
        }
        let lookup = ip.map(|ip| ip.to_string()).unwrap_or_default();
        diesel::insert_into(dsl::static_ip_address)
            .values((
                dsl::ip.eq(ip.map(IpNetwork::from)),
                dsl::alloc_type.eq(alloc_type),
                dsl::subnet_id.eq(subnet_id),
                dsl::lease_time.eq(lease_time),
                dsl::created.eq(timestamp),
                dsl::updated.eq(timestamp),
            ))
            .returning(StaticIpAddress::as_returning())
            .get_result_async(conn)
            .await
            .map_err(|e| {
                TransactionError::from_diesel(
                    e,
                    ErrorHandler::Conflict(
                        ResourceType::StaticIpAddress,
                        &lookup,
                    ),
                )
            })
    }

    pub async fn static_ip_address_fetch(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        sip_id: StaticIpAddressId,
    ) -> Result<StaticIpAddress, TransactionError> {
        let lookup = sip_id.to_string();
        dsl::static_ip_address
            .filter(dsl::id.eq(sip_id))
            .select(StaticIpAddress::as_select())
            .get_result_async(conn)
            .await
            .map_err(|e| {
                TransactionError::from_diesel(
                    e,
                    ErrorHandler::NotFound(
                        ResourceType::StaticIpAddress,
                        &lookup,
                    ),
                )
            })
    }

    /// The address of `alloc_type` holding `ip`. There is at most one.
    pub async fn static_ip_address_find(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        alloc_type: IpAddressType,
        ip: IpAddr,
    ) -> Result<Option<StaticIpAddress>, TransactionError> {
        let sip = dsl::static_ip_address
            .filter(dsl::alloc_type.eq(alloc_type))
            .filter(dsl::ip.eq(IpNetwork::from(ip)))
            .select(StaticIpAddress::as_select())
            .get_result_async(conn)
            .await
            .optional()?;
        Ok(sip)
    }

    /// Overwrites the stored row with `sip`.
    pub async fn static_ip_address_update(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        sip: &StaticIpAddress,
    ) -> Result<(), TransactionError> {
        let lookup = sip
            .ip_addr()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| sip.id.to_string());
        let updated = diesel::update(dsl::static_ip_address)
            .filter(dsl::id.eq(sip.id))
            .set((
                dsl::ip.eq(sip.ip),
                dsl::alloc_type.eq(sip.alloc_type),
                dsl::subnet_id.eq(sip.subnet_id),
                dsl::lease_time.eq(sip.lease_time),
                dsl::created.eq(sip.created),
                dsl::updated.eq(sip.updated),
            ))
            .execute_async(conn)
            .await
            .map_err(|e| {
                TransactionError::from_diesel(
                    e,
                    ErrorHandler::Conflict(
                        ResourceType::StaticIpAddress,
                        &lookup,
                    ),
                )
            })?;
        if updated == 0 {
            return Err(Error::not_found(
                ResourceType::StaticIpAddress,
                sip.id,
            )
            .into());
        }
        Ok(())
    }

    /// Deletes an address along with its interface and DNS links.
    pub async fn static_ip_address_delete(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        sip_id: StaticIpAddressId,
    ) -> Result<(), TransactionError> {
        diesel::delete(dsl::static_ip_address)
            .filter(dsl::id.eq(sip_id))
            .execute_async(conn)
            .await?;
        Ok(())
    }

    pub async fn static_ip_address_list(&self) -> ListResult<StaticIpAddress> {
        let conn = self.pool_connection().await?;
        dsl::static_ip_address
            .order(dsl::id)
            .select(StaticIpAddress::as_select())
            .load_async(&*conn)
            .await
            .map_err(|e| public_error_from_diesel(e, ErrorHandler::Server))
    }

    pub async fn static_ip_address_lookup(
        &self,
        sip_id: StaticIpAddressId,
    ) -> LookupResult<StaticIpAddress> {
        let conn = self.pool_connection().await?;
        Ok(self.static_ip_address_fetch(&conn, sip_id).await?)
    }
}
