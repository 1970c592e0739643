// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::IpFamily;
use super::MacAddress;
use crate::db::error::LeaseUpdateError;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Hostname some DHCP servers report for clients that sent none.
const NO_HOSTNAME: &str = "(none)";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseAction {
    Commit,
    Expiry,
    Release,
}

impl fmt::Display for LeaseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LeaseAction::Commit => "commit",
            LeaseAction::Expiry => "expiry",
            LeaseAction::Release => "release",
        })
    }
}

impl FromStr for LeaseAction {
    type Err = LeaseUpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(LeaseAction::Commit),
            "expiry" => Ok(LeaseAction::Expiry),
            "release" => Ok(LeaseAction::Release),
            _ => Err(LeaseUpdateError::new(format!(
                "Unknown lease action: {}",
                s
            ))),
        }
    }
}

/// A lease event as a rack controller sends it.
///
/// Every field is kept in its wire form; [`LeaseUpdate::try_from`] does the
/// validation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LeaseUpdateParams {
    pub action: String,
    pub mac: String,
    pub ip_family: String,
    pub ip: String,
    /// Seconds since the Unix epoch at which the DHCP server saw the event.
    pub timestamp: i64,
    #[serde(default)]
    pub lease_time: Option<u32>,
    #[serde(default)]
    pub hostname: Option<String>,
}

/// A validated lease event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseUpdate {
    pub action: LeaseAction,
    pub mac: MacAddress,
    pub ip_family: IpFamily,
    pub ip: IpAddr,
    pub timestamp: DateTime<Utc>,
    /// Seconds; bounded so that it fits the database column.
    pub lease_time: Option<i32>,
    pub hostname: Option<String>,
}

impl LeaseUpdate {
    /// The client's hostname, unless it is missing, blank or `(none)`.
    pub fn usable_hostname(&self) -> Option<&str> {
        self.hostname
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty() && *h != NO_HOSTNAME)
    }
}

impl TryFrom<LeaseUpdateParams> for LeaseUpdate {
    type Error = LeaseUpdateError;

    fn try_from(params: LeaseUpdateParams) -> Result<Self, Self::Error> {
        let action: LeaseAction = params.action.parse()?;
        let ip_family: IpFamily = params.ip_family.parse()?;
        let ip: IpAddr = params.ip.parse().map_err(|_| {
            LeaseUpdateError::new(format!("Invalid IP address: {}", params.ip))
        })?;
        let mac: MacAddress = params.mac.parse().map_err(|_| {
            LeaseUpdateError::new(format!(
                "Invalid MAC address: {}",
                params.mac
            ))
        })?;
        let timestamp = DateTime::from_timestamp(params.timestamp, 0)
            .ok_or_else(|| {
                LeaseUpdateError::new(format!(
                    "Invalid timestamp: {}",
                    params.timestamp
                ))
            })?;
        let lease_time = params
            .lease_time
            .map(|t| {
                i32::try_from(t).map_err(|_| {
                    LeaseUpdateError::new(format!("Invalid lease time: {}", t))
                })
            })
            .transpose()?;
        Ok(LeaseUpdate {
            action,
            mac,
            ip_family,
            ip,
            timestamp,
            lease_time,
            hostname: params.hostname,
        })
    }
}
