// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::impl_enum_type;
use super::InterfaceId;
use super::NodeId;
use super::VlanId;
use crate::db::schema::interface;
use diesel::deserialize::{self, FromSql};
use diesel::pg::Pg;
use diesel::serialize::{self, ToSql};
use diesel::sql_types::MacAddr;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Name given to the placeholder interface created for a MAC address the
/// region has never seen before.
pub const UNKNOWN_INTERFACE_NAME: &str = "eth0";

impl_enum_type!(
    #[derive(SqlType, Debug, QueryId)]
    #[diesel(postgres_type(name = "interface_kind", schema = "public"))]
    pub struct InterfaceKindEnum;

    /// `Unknown` interfaces were observed on the network but are not attached
    /// to any known node.
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
    #[diesel(sql_type = InterfaceKindEnum)]
    #[serde(rename_all = "snake_case")]
    pub enum InterfaceKind;

    Physical => b"physical"
    Bond => b"bond"
    Vlan => b"vlan"
    Unknown => b"unknown"
);

#[derive(
    Queryable, Selectable, Clone, Debug, PartialEq, Eq, Deserialize, Serialize,
)]
#[diesel(table_name = interface)]
pub struct Interface {
    pub id: InterfaceId,
    pub name: String,
    pub kind: InterfaceKind,
    pub mac_address: MacAddress,
    pub vlan_id: Option<VlanId>,
    pub node_id: Option<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0:?}")]
pub struct InvalidMacAddress(pub String);

/// An EUI-48 address, always rendered in lowercase colon-separated form.
///
/// Parsing is lenient about what rack controllers send: colon or hyphen
/// separators, either case, octets with or without zero padding, a bare
/// string of twelve hex digits, or the dotted form (`0011.2233.4455`).
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
#[diesel(sql_type = MacAddr)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub macaddr::MacAddr6);

impl ToSql<MacAddr, Pg> for MacAddress {
    fn to_sql<'a>(
        &'a self,
        out: &mut serialize::Output<'a, '_, Pg>,
    ) -> serialize::Result {
        <[u8; 6] as ToSql<MacAddr, Pg>>::to_sql(
            &self.0.into_array(),
            &mut out.reborrow(),
        )
    }
}

impl FromSql<MacAddr, Pg> for MacAddress {
    fn from_sql(
        bytes: <Pg as diesel::backend::Backend>::RawValue<'_>,
    ) -> deserialize::Result<Self> {
        let octets = <[u8; 6] as FromSql<MacAddr, Pg>>::from_sql(bytes)?;
        Ok(MacAddress(macaddr::MacAddr6::from(octets)))
    }
}

impl MacAddress {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

fn parse_hex_group(group: &str, max_digits: usize) -> Option<u16> {
    if group.is_empty()
        || group.len() > max_digits
        || !group.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return None;
    }
    u16::from_str_radix(group, 16).ok()
}

impl FromStr for MacAddress {
    type Err = InvalidMacAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidMacAddress(s.to_string());
        let trimmed = s.trim();
        let mut octets = [0u8; 6];

        if trimmed.contains('.') {
            let groups: Vec<&str> = trimmed.split('.').collect();
            if groups.len() != 3 {
                return Err(invalid());
            }
            for (i, group) in groups.iter().enumerate() {
                let word = parse_hex_group(group, 4).ok_or_else(invalid)?;
                let [hi, lo] = word.to_be_bytes();
                octets[2 * i] = hi;
                octets[2 * i + 1] = lo;
            }
        } else if trimmed.contains(':') || trimmed.contains('-') {
            let groups: Vec<&str> = trimmed.split([':', '-']).collect();
            let separators: Vec<char> =
                trimmed.chars().filter(|c| *c == ':' || *c == '-').collect();
            if groups.len() != 6
                || separators.iter().any(|c| *c != separators[0])
            {
                return Err(invalid());
            }
            for (octet, group) in octets.iter_mut().zip(groups) {
                *octet = parse_hex_group(group, 2).ok_or_else(invalid)? as u8;
            }
        } else {
            if trimmed.len() != 12 {
                return Err(invalid());
            }
            for (i, octet) in octets.iter_mut().enumerate() {
                let group =
                    trimmed.get(2 * i..2 * i + 2).ok_or_else(invalid)?;
                *octet = parse_hex_group(group, 2).ok_or_else(invalid)? as u8;
            }
        }

        Ok(MacAddress(macaddr::MacAddr6::from(octets)))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.as_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl TryFrom<String> for MacAddress {
    type Error = InvalidMacAddress;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::MacAddress;

    #[test]
    fn test_mac_address_spellings_normalize() {
        let expected = "00:11:22:aa:bb:0c";
        for input in [
            "00:11:22:aa:bb:0c",
            "00:11:22:AA:BB:0C",
            "00-11-22-aa-bb-0c",
            "0:11:22:aa:bb:c",
            "0011.22aa.bb0c",
            "001122AABB0C",
            " 00:11:22:aa:bb:0c ",
        ] {
            let mac: MacAddress = input
                .parse()
                .unwrap_or_else(|e| panic!("parsing {input:?}: {e}"));
            assert_eq!(mac.to_string(), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_mac_address_rejects_garbage() {
        for input in [
            "",
            "00:11:22:aa:bb",
            "00:11:22:aa:bb:0c:dd",
            "00:11-22:aa:bb:0c",
            "00:11:22:aa:bb:0g",
            "000:11:22:aa:bb:0c",
            "+0:11:22:aa:bb:0c",
            "0011.22aa",
            "0011.22aa.bb0c0",
            "not a mac",
        ] {
            assert!(
                input.parse::<MacAddress>().is_err(),
                "{input:?} unexpectedly parsed"
            );
        }
    }

    #[test]
    fn test_mac_address_serde_uses_canonical_form() {
        let mac: MacAddress =
            serde_json::from_str("\"AA-BB-CC-DD-EE-FF\"").unwrap();
        assert_eq!(
            serde_json::to_string(&mac).unwrap(),
            "\"aa:bb:cc:dd:ee:ff\""
        );
    }
}
