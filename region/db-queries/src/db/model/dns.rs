// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::DnsPublicationId;
use super::DnsResourceId;
use super::DomainId;
use crate::db::schema::{dns_publication, dns_resource, domain};
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// Longest label a hostname may coerce to.
///
/// This is one more than RFC 1035 allows; the region has always accepted
/// 64-character labels and existing resources depend on it.
const MAX_LABEL_LEN: usize = 64;

#[derive(
    Queryable, Selectable, Clone, Debug, PartialEq, Eq, Deserialize, Serialize,
)]
#[diesel(table_name = domain)]
pub struct Domain {
    pub id: DomainId,
    pub name: String,
    pub ttl: Option<i32>,
    pub is_default: bool,
}

#[derive(
    Queryable, Selectable, Clone, Debug, PartialEq, Eq, Deserialize, Serialize,
)]
#[diesel(table_name = dns_resource)]
pub struct DnsResource {
    pub id: DnsResourceId,
    pub name: String,
    pub domain_id: DomainId,
    pub address_ttl: Option<i32>,
}

/// One record of the zone-update log consumed by the DNS writer.
#[derive(
    Queryable, Selectable, Clone, Debug, PartialEq, Eq, Deserialize, Serialize,
)]
#[diesel(table_name = dns_publication)]
pub struct DnsPublication {
    pub id: DnsPublicationId,
    pub serial: i64,
    pub created: DateTime<Utc>,
    pub source: String,
    pub update: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum DnsUpdateAction {
    Insert,
    InsertName,
    Update,
    Delete,
}

impl fmt::Display for DnsUpdateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DnsUpdateAction::Insert => "INSERT",
            DnsUpdateAction::InsertName => "INSERT-NAME",
            DnsUpdateAction::Update => "UPDATE",
            DnsUpdateAction::Delete => "DELETE",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    pub fn for_ip(ip: &IpAddr) -> RecordType {
        match ip {
            IpAddr::V4(_) => RecordType::A,
            IpAddr::V6(_) => RecordType::Aaaa,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
        })
    }
}

/// A single zone change, serialized as
/// `<ACTION> <zone> <label> <rtype>[ <ttl>][ <answer>]`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DnsUpdate {
    pub action: DnsUpdateAction,
    pub zone: String,
    pub label: String,
    pub rtype: RecordType,
    pub ttl: Option<u32>,
    pub answer: Option<String>,
}

impl DnsUpdate {
    /// Adds `answer` under `label`.
    pub fn insert(
        zone: &str,
        label: &str,
        ip: &IpAddr,
        ttl: u32,
    ) -> DnsUpdate {
        DnsUpdate {
            action: DnsUpdateAction::Insert,
            zone: zone.to_string(),
            label: label.to_string(),
            rtype: RecordType::for_ip(ip),
            ttl: Some(ttl),
            answer: Some(ip.to_string()),
        }
    }

    /// Removes one address from `label`.
    pub fn delete_ip(zone: &str, label: &str, ip: &IpAddr) -> DnsUpdate {
        DnsUpdate {
            action: DnsUpdateAction::Delete,
            zone: zone.to_string(),
            label: label.to_string(),
            rtype: RecordType::for_ip(ip),
            ttl: None,
            answer: Some(ip.to_string()),
        }
    }

    /// Removes every record of `rtype` under `label`.
    pub fn delete_name(
        zone: &str,
        label: &str,
        rtype: RecordType,
    ) -> DnsUpdate {
        DnsUpdate {
            action: DnsUpdateAction::Delete,
            zone: zone.to_string(),
            label: label.to_string(),
            rtype,
            ttl: None,
            answer: None,
        }
    }
}

impl fmt::Display for DnsUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.action, self.zone, self.label, self.rtype)?;
        if let Some(ttl) = self.ttl {
            write!(f, " {}", ttl)?;
        }
        if let Some(answer) = &self.answer {
            write!(f, " {}", answer)?;
        }
        Ok(())
    }
}

/// Turns a DHCP client's hostname into a DNS label.
///
/// The result is lowercase, every run of characters outside `[a-z0-9-]`
/// becomes a single `-`, and leading and trailing dashes are dropped.
/// Returns `None` if nothing usable is left or the label would be longer
/// than 64 characters.
pub fn coerce_to_valid_hostname(hostname: &str) -> Option<String> {
    let mut label = String::with_capacity(hostname.len());
    let mut in_run = false;
    for c in hostname.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
            label.push(c);
            in_run = false;
        } else if !in_run {
            label.push('-');
            in_run = true;
        }
    }
    let label = label.trim_matches('-');
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        None
    } else {
        Some(label.to_string())
    }
}
