// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::impl_enum_type;
use super::IpRangeId;
use super::SubnetId;
use super::VlanId;
use crate::db::error::LeaseUpdateError;
use crate::db::schema::{ip_range, subnet, vlan};
use ipnetwork::IpNetwork;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Version of the Internet Protocol an address or network belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    Ipv4,
    Ipv6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> IpFamily {
        match ip {
            IpAddr::V4(_) => IpFamily::Ipv4,
            IpAddr::V6(_) => IpFamily::Ipv6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::Ipv4 => f.write_str("ipv4"),
            IpFamily::Ipv6 => f.write_str("ipv6"),
        }
    }
}

impl FromStr for IpFamily {
    type Err = LeaseUpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4" => Ok(IpFamily::Ipv4),
            "ipv6" => Ok(IpFamily::Ipv6),
            _ => Err(LeaseUpdateError::new(format!(
                "Unknown IP family: {}",
                s
            ))),
        }
    }
}

#[derive(
    Queryable, Selectable, Clone, Debug, PartialEq, Eq, Deserialize, Serialize,
)]
#[diesel(table_name = vlan)]
pub struct Vlan {
    pub id: VlanId,
    /// 802.1Q VLAN id, 0 through 4095.
    pub vid: i32,
    pub name: String,
}

#[derive(
    Queryable, Selectable, Clone, Debug, PartialEq, Eq, Deserialize, Serialize,
)]
#[diesel(table_name = subnet)]
pub struct Subnet {
    pub id: SubnetId,
    pub name: String,
    pub cidr: IpNetwork,
    pub vlan_id: VlanId,
}

impl Subnet {
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.cidr.ip())
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.cidr.contains(ip)
    }
}

impl_enum_type!(
    #[derive(SqlType, Debug, QueryId)]
    #[diesel(postgres_type(name = "ip_range_kind", schema = "public"))]
    pub struct IpRangeKindEnum;

    /// `Dynamic` ranges are handed out by the DHCP server; `Reserved` ranges
    /// are set aside by an operator and never leased.
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
    #[diesel(sql_type = IpRangeKindEnum)]
    #[serde(rename_all = "snake_case")]
    pub enum IpRangeKind;

    Dynamic => b"dynamic"
    Reserved => b"reserved"
);

/// An inclusive interval of addresses within a subnet.
///
/// Both ends are stored as host networks (`/32` or `/128`).
#[derive(
    Queryable, Selectable, Clone, Debug, PartialEq, Eq, Deserialize, Serialize,
)]
#[diesel(table_name = ip_range)]
pub struct IpRange {
    pub id: IpRangeId,
    pub subnet_id: SubnetId,
    pub kind: IpRangeKind,
    pub start_ip: IpNetwork,
    pub end_ip: IpNetwork,
}

impl IpRange {
    pub fn start(&self) -> IpAddr {
        self.start_ip.ip()
    }

    pub fn end(&self) -> IpAddr {
        self.end_ip.ip()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        // `IpAddr` orders every V4 address before every V6 address, so the
        // family has to be checked separately.
        IpFamily::of(&ip) == IpFamily::of(&self.start())
            && self.start() <= ip
            && ip <= self.end()
    }
}
