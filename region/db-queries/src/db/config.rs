// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Datastore tunables, deserialized from the `[database]` and `[dns]`
//! sections of the region configuration file.

use serde::Deserialize;
use serde::Serialize;

/// Where the region database lives, and how the datastore uses it.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Upper bound on pooled connections.  Sessions claimed for advisory
    /// locks are opened separately and do not count against it.
    pub max_connections: u32,
    /// How many times a transaction closure is attempted before a
    /// serialization conflict is reported to the caller.
    pub max_transaction_attempts: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://maas@localhost/maasdb".to_string(),
            max_connections: 16,
            max_transaction_attempts: 10,
        }
    }
}

/// Settings for the DNS records derived from DHCP leases.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Name of the default domain, created when the database is initialized.
    pub default_domain: String,
    /// TTL used when neither the resource nor its domain sets one.
    pub default_ttl: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self { default_domain: "maas".to_string(), default_ttl: 30 }
    }
}
