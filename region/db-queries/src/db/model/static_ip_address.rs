// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::impl_enum_type;
use super::IpFamily;
use super::StaticIpAddressId;
use super::SubnetId;
use chrono::DateTime;
use chrono::Utc;
use crate::db::schema::static_ip_address;
use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;

impl_enum_type!(
    #[derive(SqlType, Debug, QueryId)]
    #[diesel(postgres_type(name = "ip_address_type", schema = "public"))]
    pub struct IpAddressTypeEnum;

    /// How an address came to be assigned: picked by the region when a node
    /// is deployed (`Auto`), pinned to an interface by an operator
    /// (`Sticky`), reserved by an operator without an interface
    /// (`UserReserved`), or learned from a DHCP lease (`Discovered`).
    #[derive(
        Clone,
        Copy,
        Debug,
        PartialEq,
        Eq,
        Hash,
        AsExpression,
        FromSqlRow,
        Deserialize,
        Serialize,
    )]
    #[diesel(sql_type = IpAddressTypeEnum)]
    #[serde(rename_all = "snake_case")]
    pub enum IpAddressType;

    Auto => b"auto"
    Sticky => b"sticky"
    UserReserved => b"user_reserved"
    Discovered => b"discovered"
);

impl IpAddressType {
    /// Whether this address was assigned by the region or an operator rather
    /// than learned from DHCP.
    pub fn is_static(&self) -> bool {
        !matches!(self, IpAddressType::Discovered)
    }
}

/// An address bound (or, with `ip` unset, formerly bound) to interfaces.
///
/// For discovered addresses `created` and `updated` carry the timestamp of
/// the lease event that produced them, not the time the row was written.
#[derive(
    Queryable, Selectable, Clone, Debug, PartialEq, Eq, Deserialize, Serialize,
)]
#[diesel(table_name = static_ip_address)]
pub struct StaticIpAddress {
    pub id: StaticIpAddressId,
    /// Stored as a host network (`/32` or `/128`).
    pub ip: Option<IpNetwork>,
    pub alloc_type: IpAddressType,
    pub subnet_id: Option<SubnetId>,
    /// Seconds.
    pub lease_time: Option<i32>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl StaticIpAddress {
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.ip.map(|ip| ip.ip())
    }

    /// Returns the family of the address, if it has one.
    pub fn family(&self) -> Option<IpFamily> {
        self.ip_addr().as_ref().map(IpFamily::of)
    }
}
