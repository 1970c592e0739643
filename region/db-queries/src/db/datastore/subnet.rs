// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`Vlan`]s, [`Subnet`]s and [`IpRange`]s.

use super::DataStore;
use crate::db::error::CreateResult;
use crate::db::error::Error;
use crate::db::error::ErrorHandler;
use crate::db::error::ResourceType;
use crate::db::error::TransactionError;
use crate::db::locks;
use crate::db::model::IpFamily;
use crate::db::model::IpRange;
use crate::db::model::IpRangeKind;
use crate::db::model::Subnet;
use crate::db::model::SubnetId;
use crate::db::model::Vlan;
use crate::db::model::VlanId;
use crate::db::pool::DbConnection;
use crate::db::schema::{ip_range, subnet, vlan};
use async_bb8_diesel::AsyncRunQueryDsl;
use diesel::prelude::*;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

impl DataStore {
    pub async fn vlan_create(&self, vid: u16, name: &str) -> CreateResult<Vlan> {
        let conn = self.pool_connection().await?;
        let lookup = vid.to_string();
        diesel::insert_into(vlan::table)
            .values((vlan::vid.eq(i32::from(vid)), vlan::name.eq(name.to_string())))
            .returning(Vlan::as_returning())
            .get_result_async(&*conn)
            .await
            .map_err(|e| {
                crate::db::error::public_error_from_diesel(
                    e,
                    ErrorHandler::Conflict(ResourceType::Vlan, &lookup),
                )
            })
    }

    /// Creates a subnet on `vlan_id`. Host bits in `cidr` are cleared.
    pub async fn subnet_create(
        &self,
        name: &str,
        cidr: IpNetwork,
        vlan_id: VlanId,
    ) -> CreateResult<Subnet> {
        let cidr = IpNetwork::new(cidr.network(), cidr.prefix())
            .map_err(|e| Error::invalid_request(&e.to_string()))?;
        let conn = self.pool_connection().await?;
        self.transaction_retry_wrapper("subnet_create")
            .transaction(&conn, |conn| async move {
                locks::SUBNET_CONFIGURATION.acquire(&conn).await?;
                let vlan_exists = diesel::select(diesel::dsl::exists(
                    vlan::table.filter(vlan::id.eq(vlan_id)),
                ))
                .get_result_async::<bool>(&conn)
                .await?;
                if !vlan_exists {
                    return Err(
                        Error::not_found(ResourceType::Vlan, vlan_id).into()
                    );
                }
                let lookup = cidr.to_string();
                let subnet = diesel::insert_into(subnet::table)
                    .values((
                        subnet::name.eq(name.to_string()),
                        subnet::cidr.eq(cidr),
                        subnet::vlan_id.eq(vlan_id),
                    ))
                    .returning(Subnet::as_returning())
                    .get_result_async(&conn)
                    .await
                    .map_err(|e| {
                        TransactionError::from_diesel(
                            e,
                            ErrorHandler::Conflict(
                                ResourceType::Subnet,
                                &lookup,
                            ),
                        )
                    })?;
                info!(
                    &self.log,
                    "created subnet";
                    "subnet_id" => %subnet.id,
                    "cidr" => %cidr,
                );
                Ok(subnet)
            })
            .await
    }

    /// Creates a range of `kind` spanning `start_ip..=end_ip` on a subnet.
    ///
    /// Both ends must lie within the subnet, and the range may not overlap
    /// another range of the same subnet.
    pub async fn ip_range_create(
        &self,
        subnet_id: SubnetId,
        kind: IpRangeKind,
        start_ip: IpAddr,
        end_ip: IpAddr,
    ) -> CreateResult<IpRange> {
        let conn = self.pool_connection().await?;
        self.transaction_retry_wrapper("ip_range_create")
            .transaction(&conn, |conn| async move {
                locks::SUBNET_CONFIGURATION.acquire(&conn).await?;
                let subnet = self.subnet_fetch(&conn, subnet_id).await?;
                if IpFamily::of(&start_ip) != subnet.family()
                    || IpFamily::of(&end_ip) != subnet.family()
                {
                    return Err(Error::invalid_request(
                        "IP range must be of the same family as its subnet",
                    )
                    .into());
                }
                if !subnet.contains(start_ip) || !subnet.contains(end_ip) {
                    return Err(Error::invalid_request(&format!(
                        "IP range {}-{} is not within subnet {}",
                        start_ip, end_ip, subnet.cidr
                    ))
                    .into());
                }
                if start_ip > end_ip {
                    return Err(Error::invalid_request(
                        "start of IP range must not be after its end",
                    )
                    .into());
                }
                let overlapping = self
                    .ip_range_list(&conn, subnet_id)
                    .await?
                    .iter()
                    .any(|r| r.start() <= end_ip && start_ip <= r.end());
                if overlapping {
                    return Err(Error::invalid_request(&format!(
                        "IP range {}-{} overlaps an existing range",
                        start_ip, end_ip
                    ))
                    .into());
                }
                let range = diesel::insert_into(ip_range::table)
                    .values((
                        ip_range::subnet_id.eq(subnet_id),
                        ip_range::kind.eq(kind),
                        ip_range::start_ip.eq(IpNetwork::from(start_ip)),
                        ip_range::end_ip.eq(IpNetwork::from(end_ip)),
                    ))
                    .returning(IpRange::as_returning())
                    .get_result_async(&conn)
                    .await?;
                Ok(range)
            })
            .await
    }

    pub async fn subnet_fetch(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        subnet_id: SubnetId,
    ) -> Result<Subnet, TransactionError> {
        let lookup = subnet_id.to_string();
        subnet::table
            .filter(subnet::id.eq(subnet_id))
            .select(Subnet::as_select())
            .get_result_async(conn)
            .await
            .map_err(|e| {
                TransactionError::from_diesel(
                    e,
                    ErrorHandler::NotFound(ResourceType::Subnet, &lookup),
                )
            })
    }

    async fn ip_range_list(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        subnet_id: SubnetId,
    ) -> Result<Vec<IpRange>, TransactionError> {
        let ranges = ip_range::table
            .filter(ip_range::subnet_id.eq(subnet_id))
            .order(ip_range::id)
            .select(IpRange::as_select())
            .load_async(conn)
            .await?;
        Ok(ranges)
    }

    /// The most specific subnet containing `ip`.
    ///
    /// Subnets with the same prefix length are ranked by id, lowest first.
    pub async fn subnet_best_for_ip(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        ip: IpAddr,
    ) -> Result<Option<Subnet>, TransactionError> {
        let subnets: Vec<Subnet> = subnet::table
            .order(subnet::id)
            .select(Subnet::as_select())
            .load_async(conn)
            .await?;
        Ok(subnets
            .into_iter()
            .filter(|subnet| subnet.contains(ip))
            .fold(None, |best: Option<Subnet>, subnet| match best {
                Some(b) if b.cidr.prefix() >= subnet.cidr.prefix() => Some(b),
                _ => Some(subnet),
            }))
    }

    /// The dynamic range of `subnet` that contains `ip`, if any.
    pub async fn ip_range_dynamic_for_ip(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        subnet: &Subnet,
        ip: IpAddr,
    ) -> Result<Option<IpRange>, TransactionError> {
        Ok(self.ip_range_list(conn, subnet.id).await?.into_iter().find(
            |range| range.kind == IpRangeKind::Dynamic && range.contains(ip),
        ))
    }
}
