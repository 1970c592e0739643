// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test support code that can be enabled by dependencies via this crate's
//! `testing` feature.
//!
//! This feature should only be enabled under `dev-dependencies` to avoid this
//! test support code leaking into release binaries.

use super::InterfaceCreate;
use super::StaticIpAddressCreate;
use crate::db::model::Interface;
use crate::db::model::InterfaceId;
use crate::db::model::InterfaceKind;
use crate::db::model::IpAddressType;
use crate::db::model::IpFamily;
use crate::db::model::IpRange;
use crate::db::model::IpRangeKind;
use crate::db::model::LeaseUpdateParams;
use crate::db::model::NodeId;
use crate::db::model::StaticIpAddress;
use crate::db::model::Subnet;
use crate::db::model::Vlan;
use crate::db::model::VlanId;
use crate::db::DataStore;
use crate::db::DatabaseConfig;
use crate::db::DbConnection;
use crate::db::DnsConfig;
use crate::db::Pool;
use async_bb8_diesel::AsyncSimpleConnection;
use diesel::Connection as _;
use dropshot::test_util::LogContext;
use maas_test_utils::dev;
use maas_test_utils::dev::db::PostgresInstance;
use std::net::IpAddr;
use std::sync::Arc;

/// A fresh database, created for one test on a [`PostgresInstance`] and
/// dropped again by [`TestDatabase::terminate`].
pub async fn test_setup_database(
    logctx: &LogContext,
) -> (PostgresInstance, String) {
    let server = dev::db::start_for_test(logctx)
        .await
        .expect("failed to start postgres");
    let name = format!("region_test_{}", uuid::Uuid::new_v4().simple());
    info!(
        &logctx.log,
        "creating test database";
        "server" => server.server_url(),
        "database" => &name,
    );
    admin_execute(&server, format!("CREATE DATABASE {name}")).await;
    (server, name)
}

// Runs `sql` on the server's `postgres` maintenance database.
async fn admin_execute(server: &PostgresInstance, sql: String) {
    let url = server.database_url("postgres");
    let conn = tokio::task::spawn_blocking(move || {
        DbConnection::establish(&url)
    })
    .await
    .unwrap()
    .expect("failed to connect to the postgres maintenance database");
    async_bb8_diesel::Connection::new(conn)
        .batch_execute_async(&sql)
        .await
        .unwrap_or_else(|e| panic!("failed to run {sql:?}: {e}"));
}

/// An initialized, empty region database.
pub struct TestDatabase {
    server: PostgresInstance,
    name: String,
    datastore: Arc<DataStore>,
}

impl TestDatabase {
    pub async fn new(logctx: &LogContext) -> Self {
        Self::new_with_config(
            logctx,
            DatabaseConfig::default(),
            DnsConfig::default(),
        )
        .await
    }

    /// `database_config.url` is replaced with the test database's.
    pub async fn new_with_config(
        logctx: &LogContext,
        database_config: DatabaseConfig,
        dns_config: DnsConfig,
    ) -> Self {
        let (server, name) = test_setup_database(logctx).await;
        let database_config =
            DatabaseConfig { url: server.database_url(&name), ..database_config };
        let pool = Pool::new(&logctx.log, &database_config);
        let datastore = Arc::new(DataStore::new(
            &logctx.log,
            pool,
            database_config,
            dns_config,
        ));
        datastore.initialize().await.unwrap();
        TestDatabase { server, name, datastore }
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.datastore
    }

    /// Configuration that reaches this database, for building more pools.
    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            url: self.server.database_url(&self.name),
            ..DatabaseConfig::default()
        }
    }

    /// Drops the database and stops the server, if the test started one.
    pub async fn terminate(mut self) {
        admin_execute(
            &self.server,
            format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", self.name),
        )
        .await;
        self.server.cleanup().await.unwrap();
    }
}

/// A VLAN with one subnet that has one dynamic range.
pub struct TestNetwork {
    pub vlan: Vlan,
    pub subnet: Subnet,
    pub dynamic_range: IpRange,
}

pub async fn make_network(
    datastore: &DataStore,
    vid: u16,
    cidr: &str,
    dynamic_start: &str,
    dynamic_end: &str,
) -> TestNetwork {
    let vlan =
        datastore.vlan_create(vid, &format!("vlan-{}", vid)).await.unwrap();
    let subnet = datastore
        .subnet_create(
            &format!("subnet-{}", cidr),
            cidr.parse().unwrap(),
            vlan.id,
        )
        .await
        .unwrap();
    let dynamic_range = datastore
        .ip_range_create(
            subnet.id,
            IpRangeKind::Dynamic,
            dynamic_start.parse().unwrap(),
            dynamic_end.parse().unwrap(),
        )
        .await
        .unwrap();
    TestNetwork { vlan, subnet, dynamic_range }
}

pub async fn make_interface(
    datastore: &DataStore,
    name: &str,
    kind: InterfaceKind,
    mac: &str,
    vlan_id: Option<VlanId>,
    node_id: Option<NodeId>,
) -> Interface {
    datastore
        .interface_create(InterfaceCreate {
            name: name.to_string(),
            kind,
            mac_address: mac.parse().unwrap(),
            vlan_id,
            node_id,
        })
        .await
        .unwrap()
}

/// Creates an address on `subnet` linked to `interface_ids`.
pub async fn make_ip_address(
    datastore: &DataStore,
    alloc_type: IpAddressType,
    ip: Option<&str>,
    subnet: &Subnet,
    interface_ids: &[InterfaceId],
) -> StaticIpAddress {
    datastore
        .static_ip_address_create(StaticIpAddressCreate {
            ip: ip.map(|ip| ip.parse().unwrap()),
            alloc_type,
            subnet_id: Some(subnet.id),
            lease_time: None,
            interface_ids: interface_ids.to_vec(),
        })
        .await
        .unwrap()
}

/// A lease event with no hostname and no lease time.
pub fn lease_params(
    action: &str,
    mac: &str,
    ip: &str,
    timestamp: i64,
) -> LeaseUpdateParams {
    let family = ip.parse::<IpAddr>().map(|ip| IpFamily::of(&ip));
    LeaseUpdateParams {
        action: action.to_string(),
        mac: mac.to_string(),
        ip_family: family.map(|f| f.to_string()).unwrap_or_default(),
        ip: ip.to_string(),
        timestamp,
        lease_time: None,
        hostname: None,
    }
}
