// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`Interface`]s.

use super::DataStore;
use crate::db::error::CreateResult;
use crate::db::error::Error;
use crate::db::error::ListResult;
use crate::db::error::ResourceType;
use crate::db::error::TransactionError;
use crate::db::model::Interface;
use crate::db::model::InterfaceId;
use crate::db::model::InterfaceKind;
use crate::db::model::MacAddress;
use crate::db::model::NodeId;
use crate::db::model::StaticIpAddress;
use crate::db::model::StaticIpAddressId;
use crate::db::model::VlanId;
use crate::db::model::UNKNOWN_INTERFACE_NAME;
use crate::db::pool::DbConnection;
use crate::db::schema::{interface, interface_ip_address, node, vlan};
use crate::db::schema::static_ip_address;
use async_bb8_diesel::AsyncRunQueryDsl;
use diesel::prelude::*;

/// Parameters for a new interface.
#[derive(Clone, Debug)]
pub struct InterfaceCreate {
    pub name: String,
    pub kind: InterfaceKind,
    pub mac_address: MacAddress,
    pub vlan_id: Option<VlanId>,
    pub node_id: Option<NodeId>,
}

impl DataStore {
    pub async fn interface_create(
        &self,
        params: InterfaceCreate,
    ) -> CreateResult<Interface> {
        let params = &params;
        self.transaction("interface_create", |conn| async move {
            self.interface_insert(&conn, params.clone()).await
        })
        .await
    }

    pub async fn interface_insert(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        params: InterfaceCreate,
    ) -> Result<Interface, TransactionError> {
        if params.name.is_empty() {
            return Err(Error::invalid_request(
                "interface name cannot be empty",
            )
            .into());
        }
        if let Some(vlan_id) = params.vlan_id {
            let exists = diesel::select(diesel::dsl::exists(
                vlan::table.filter(vlan::id.eq(vlan_id)),
            ))
            .get_result_async::<bool>(conn)
            .await?;
            if !exists {
                return Err(Error::not_found(ResourceType::Vlan, vlan_id).into());
            }
        }
        if let Some(node_id) = params.node_id {
            let exists = diesel::select(diesel::dsl::exists(
                node::table.filter(node::id.eq(node_id)),
            ))
            .get_result_async::<bool>(conn)
            .await?;
            if !exists {
                return Err(Error::not_found(ResourceType::Node, node_id).into());
            }
        }
        let interface = diesel::insert_into(interface::table)
            .values((
                interface::name.eq(params.name),
                interface::kind.eq(params.kind),
                interface::mac_address.eq(params.mac_address),
                interface::vlan_id.eq(params.vlan_id),
                interface::node_id.eq(params.node_id),
            ))
            .returning(Interface::as_returning())
            .get_result_async(conn)
            .await?;
        Ok(interface)
    }

    /// Records a MAC address seen on `vlan_id` that belongs to no known
    /// node.
    pub async fn interface_insert_unknown(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        mac_address: MacAddress,
        vlan_id: VlanId,
    ) -> Result<Interface, TransactionError> {
        self.interface_insert(
            conn,
            InterfaceCreate {
                name: UNKNOWN_INTERFACE_NAME.to_string(),
                kind: InterfaceKind::Unknown,
                mac_address,
                vlan_id: Some(vlan_id),
                node_id: None,
            },
        )
        .await
    }

    /// Every interface with `mac_address`, of any kind, oldest first. Bonds
    /// and their members commonly share one.
    pub async fn interfaces_by_mac(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        mac_address: &MacAddress,
    ) -> Result<Vec<Interface>, TransactionError> {
        let interfaces = interface::table
            .filter(interface::mac_address.eq(*mac_address))
            .order(interface::id)
            .select(Interface::as_select())
            .load_async(conn)
            .await?;
        Ok(interfaces)
    }

    pub async fn interface_list_by_mac(
        &self,
        mac_address: &MacAddress,
    ) -> ListResult<Interface> {
        let conn = self.pool_connection().await?;
        Ok(self.interfaces_by_mac(&conn, mac_address).await?)
    }

    /// Links an interface and an address. Linking twice is a no-op.
    pub async fn interface_link_ip_address(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        interface_id: InterfaceId,
        sip_id: StaticIpAddressId,
    ) -> Result<(), TransactionError> {
        diesel::insert_into(interface_ip_address::table)
            .values((
                interface_ip_address::interface_id.eq(interface_id),
                interface_ip_address::static_ip_address_id.eq(sip_id),
            ))
            .on_conflict_do_nothing()
            .execute_async(conn)
            .await?;
        Ok(())
    }

    pub async fn interface_unlink_ip_address(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        interface_id: InterfaceId,
        sip_id: StaticIpAddressId,
    ) -> Result<(), TransactionError> {
        diesel::delete(interface_ip_address::table)
            .filter(interface_ip_address::interface_id.eq(interface_id))
            .filter(interface_ip_address::static_ip_address_id.eq(sip_id))
            .execute_async(conn)
            .await?;
        Ok(())
    }

    /// The addresses linked to `interface_id`, including released ones,
    /// oldest first.
    pub async fn interface_ip_addresses_in_txn(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        interface_id: InterfaceId,
    ) -> Result<Vec<StaticIpAddress>, TransactionError> {
        let addresses = interface_ip_address::table
            .inner_join(static_ip_address::table)
            .filter(interface_ip_address::interface_id.eq(interface_id))
            .order(static_ip_address::id)
            .select(StaticIpAddress::as_select())
            .load_async(conn)
            .await?;
        Ok(addresses)
    }

    pub async fn interface_ip_addresses(
        &self,
        interface_id: InterfaceId,
    ) -> ListResult<StaticIpAddress> {
        let conn = self.pool_connection().await?;
        Ok(self.interface_ip_addresses_in_txn(&conn, interface_id).await?)
    }
}
