// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of DHCP lease events with the database.
//!
//! Each event is applied in one transaction. After a commit, the client's
//! interfaces hold exactly one discovered address of the event's family,
//! carrying the leased IP. After an expiry or release they hold exactly one
//! discovered address of that family with no IP, which records that the
//! client was seen on the subnet.

use super::DataStore;
use crate::db::error::Error;
use crate::db::error::InternalContext;
use crate::db::error::LeaseUpdateError;
use crate::db::error::TransactionError;
use crate::db::locks;
use crate::db::model::coerce_to_valid_hostname;
use crate::db::model::InterfaceId;
use crate::db::model::IpAddressType;
use crate::db::model::IpFamily;
use crate::db::model::LeaseAction;
use crate::db::model::LeaseUpdate;
use crate::db::model::LeaseUpdateParams;
use crate::db::model::StaticIpAddress;
use crate::db::model::Subnet;
use crate::db::pool::DbConnection;
use crate::db::schema::{interface_ip_address, static_ip_address};
use async_bb8_diesel::AsyncRunQueryDsl;
use diesel::prelude::*;
use slog::Logger;
use std::collections::BTreeSet;

impl DataStore {
    /// Validates and applies one lease event reported by a rack controller.
    pub async fn update_lease(
        &self,
        params: LeaseUpdateParams,
    ) -> Result<(), Error> {
        let update = LeaseUpdate::try_from(params)?;
        let update = &update;
        let conn = self.pool_connection().await?;
        self.transaction_retry_wrapper("update_lease")
            .transaction(&conn, |conn| async move {
                self.update_lease_on_connection(&conn, update).await
            })
            .await
            .with_internal_context(|| {
                format!(
                    "{} lease for {} on {}",
                    update.action, update.ip, update.mac
                )
            })
    }

    /// Applies `update` in the transaction open on `conn`.
    pub async fn update_lease_on_connection(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        update: &LeaseUpdate,
    ) -> Result<(), TransactionError> {
        let log = self.log.new(o!(
            "action" => update.action.to_string(),
            "ip" => update.ip.to_string(),
            "mac" => update.mac.to_string(),
        ));
        locks::SUBNET_CONFIGURATION.shared().acquire(conn).await?;

        let subnet =
            self.subnet_best_for_ip(conn, update.ip).await?.ok_or_else(|| {
                LeaseUpdateError::new(format!(
                    "No subnet exists for: {}",
                    update.ip
                ))
            })?;
        if subnet.family() != update.ip_family {
            return Err(LeaseUpdateError::new(format!(
                "Family for the subnet does not match. Expected: {}",
                update.ip_family
            ))
            .into());
        }
        if self
            .ip_range_dynamic_for_ip(conn, &subnet, update.ip)
            .await?
            .is_none()
        {
            debug!(&log, "address is outside every dynamic range; ignoring");
            return Ok(());
        }

        let mut interfaces = self.interfaces_by_mac(conn, &update.mac).await?;
        if interfaces.is_empty() {
            if update.action != LeaseAction::Commit {
                debug!(&log, "no interface has this MAC address; ignoring");
                return Ok(());
            }
            let interface = self
                .interface_insert_unknown(conn, update.mac, subnet.vlan_id)
                .await?;
            info!(
                &log,
                "created interface for unknown MAC address";
                "interface_id" => %interface.id,
                "vlan_id" => %subnet.vlan_id,
            );
            interfaces.push(interface);
        }
        let interface_ids: BTreeSet<InterfaceId> =
            interfaces.iter().map(|interface| interface.id).collect();

        let target = self
            .lease_prune_discovered(conn, &log, &interface_ids, &subnet, update)
            .await?;
        match update.action {
            LeaseAction::Commit => {
                self.lease_commit(
                    conn,
                    &log,
                    &interface_ids,
                    &subnet,
                    update,
                    target,
                )
                .await
            }
            LeaseAction::Expiry | LeaseAction::Release => {
                self.lease_release(
                    conn,
                    &log,
                    &interface_ids,
                    &subnet,
                    update,
                    target,
                )
                .await
            }
        }
    }

    // Deletes the discovered addresses of the event's family linked to
    // `interface_ids`, except the one the event applies to. That is the row
    // already holding the event's IP or, failing that, a row with no IP on
    // the event's subnet. It is returned, if there is one.
    async fn lease_prune_discovered(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        log: &Logger,
        interface_ids: &BTreeSet<InterfaceId>,
        subnet: &Subnet,
        update: &LeaseUpdate,
    ) -> Result<Option<StaticIpAddress>, TransactionError> {
        let linked: Vec<StaticIpAddress> = interface_ip_address::table
            .inner_join(static_ip_address::table)
            .filter(
                interface_ip_address::interface_id
                    .eq_any(interface_ids.iter().copied().collect::<Vec<_>>()),
            )
            .filter(
                static_ip_address::alloc_type.eq(IpAddressType::Discovered),
            )
            .order(static_ip_address::id)
            .select(StaticIpAddress::as_select())
            .distinct()
            .load_async(conn)
            .await?;

        let mut exact = None;
        let mut unassigned = Vec::new();
        let mut stale = Vec::new();
        for sip in linked {
            let family = match (sip.ip_addr(), sip.subnet_id) {
                (Some(ip), _) => Some(IpFamily::of(&ip)),
                (None, Some(id)) if id == subnet.id => Some(subnet.family()),
                (None, Some(id)) => {
                    Some(self.subnet_fetch(conn, id).await?.family())
                }
                (None, None) => None,
            };
            if family != Some(update.ip_family) {
                continue;
            }
            match sip.ip_addr() {
                Some(ip) if ip == update.ip => exact = Some(sip),
                None if sip.subnet_id == Some(subnet.id) => {
                    unassigned.push(sip)
                }
                _ => stale.push(sip),
            }
        }

        for sip in stale {
            self.release_dynamic_hostname(conn, sip.id, None).await?;
            self.static_ip_address_delete(conn, sip.id).await?;
            info!(
                log,
                "deleted superseded discovered address";
                "sip_id" => %sip.id,
                "old_ip" => ?sip.ip_addr(),
            );
        }

        let mut retained = exact.into_iter().chain(unassigned);
        let target = retained.next();
        for surplus in retained {
            self.static_ip_address_delete(conn, surplus.id).await?;
            debug!(
                log,
                "deleted duplicate discovered address";
                "sip_id" => %surplus.id,
            );
        }
        Ok(target)
    }

    async fn lease_commit(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        log: &Logger,
        interface_ids: &BTreeSet<InterfaceId>,
        subnet: &Subnet,
        update: &LeaseUpdate,
        target: Option<StaticIpAddress>,
    ) -> Result<(), TransactionError> {
        // The IP may already be recorded against another client; that row
        // wins over the one retained for this client.
        let existing = self
            .static_ip_address_find(conn, IpAddressType::Discovered, update.ip)
            .await?;
        let mut sip = match (existing, target) {
            (Some(existing), Some(target)) => {
                if target.id != existing.id {
                    self.static_ip_address_delete(conn, target.id).await?;
                }
                existing
            }
            (Some(existing), None) => existing,
            (None, Some(target)) => target,
            (None, None) => {
                self.static_ip_address_insert(
                    conn,
                    Some(update.ip),
                    IpAddressType::Discovered,
                    Some(subnet.id),
                    update.lease_time,
                    update.timestamp,
                )
                .await?
            }
        };
        sip.ip = Some(update.ip.into());
        sip.subnet_id = Some(subnet.id);
        sip.lease_time = update.lease_time;
        sip.created = update.timestamp;
        sip.updated = update.timestamp;
        self.static_ip_address_update(conn, &sip).await?;

        let interface_list: Vec<InterfaceId> =
            interface_ids.iter().copied().collect();
        diesel::delete(interface_ip_address::table)
            .filter(interface_ip_address::static_ip_address_id.eq(sip.id))
            .filter(diesel::dsl::not(
                interface_ip_address::interface_id.eq_any(interface_list),
            ))
            .execute_async(conn)
            .await?;
        for interface_id in interface_ids {
            self.interface_link_ip_address(conn, *interface_id, sip.id)
                .await?;
        }

        match update.usable_hostname().map(coerce_to_valid_hostname) {
            None => {}
            Some(Some(hostname)) => {
                if self.node_hostname_exists(conn, &hostname).await? {
                    debug!(
                        log,
                        "hostname belongs to a node; not publishing it";
                        "hostname" => &hostname,
                    );
                    self.release_dynamic_hostname(conn, sip.id, None).await?;
                } else {
                    self.update_dynamic_hostname(conn, sip.id, &hostname)
                        .await?;
                }
            }
            Some(None) => {
                self.release_dynamic_hostname(conn, sip.id, None).await?;
            }
        }

        info!(
            log,
            "lease committed";
            "sip_id" => %sip.id,
            "interfaces" => interface_ids.len(),
        );
        Ok(())
    }

    async fn lease_release(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        log: &Logger,
        interface_ids: &BTreeSet<InterfaceId>,
        subnet: &Subnet,
        update: &LeaseUpdate,
        target: Option<StaticIpAddress>,
    ) -> Result<(), TransactionError> {
        let sip = match target {
            Some(mut sip) => {
                if sip.ip_addr() == Some(update.ip) {
                    self.release_dynamic_hostname(conn, sip.id, None).await?;
                    sip.ip = None;
                }
                sip.updated = update.timestamp;
                self.static_ip_address_update(conn, &sip).await?;
                sip
            }
            None => {
                self.static_ip_address_insert(
                    conn,
                    None,
                    IpAddressType::Discovered,
                    Some(subnet.id),
                    None,
                    update.timestamp,
                )
                .await?
            }
        };
        for interface_id in interface_ids {
            self.interface_link_ip_address(conn, *interface_id, sip.id)
                .await?;
        }
        info!(log, "lease released"; "sip_id" => %sip.id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::db::datastore::pub_test_utils::lease_params;
    use crate::db::datastore::pub_test_utils::make_interface;
    use crate::db::datastore::pub_test_utils::make_ip_address;
    use crate::db::datastore::pub_test_utils::make_network;
    use crate::db::datastore::pub_test_utils::TestDatabase;
    use crate::db::datastore::pub_test_utils::TestNetwork;
    use crate::db::error::Error;
    use crate::db::error::LeaseUpdateError;
    use crate::db::error::TransactionError;
    use crate::db::locks;
    use crate::db::model::Interface;
    use crate::db::model::InterfaceKind;
    use crate::db::model::IpAddressType;
    use crate::db::model::MacAddress;
    use crate::db::model::StaticIpAddress;
    use crate::db::model::UNKNOWN_INTERFACE_NAME;
    use crate::db::schema::domain;
    use crate::db::DataStore;
    use assert_matches::assert_matches;
    use async_bb8_diesel::AsyncConnection;
    use async_bb8_diesel::AsyncRunQueryDsl;
    use chrono::DateTime;
    use diesel::ExpressionMethods;
    use maas_test_utils::dev;
    use std::net::IpAddr;
    use std::time::Duration;

    const MAC: &str = "52:54:00:12:34:56";
    const TIMESTAMP: i64 = 1_700_000_000;

    async fn setup(datastore: &DataStore) -> TestNetwork {
        make_network(datastore, 10, "10.0.0.0/24", "10.0.0.100", "10.0.0.199")
            .await
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn physical(datastore: &DataStore, net: &TestNetwork) -> Interface {
        make_interface(
            datastore,
            "eth0",
            InterfaceKind::Physical,
            MAC,
            Some(net.vlan.id),
            None,
        )
        .await
    }

    async fn discovered(
        datastore: &DataStore,
        iface: &Interface,
    ) -> Vec<StaticIpAddress> {
        datastore
            .interface_ip_addresses(iface.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|sip| sip.alloc_type == IpAddressType::Discovered)
            .collect()
    }

    async fn commit(
        datastore: &DataStore,
        address: &str,
        timestamp: i64,
        hostname: Option<&str>,
    ) {
        let mut params = lease_params("commit", MAC, address, timestamp);
        params.lease_time = Some(600);
        params.hostname = hostname.map(str::to_string);
        datastore.update_lease(params).await.unwrap();
    }

    async fn expire(
        datastore: &DataStore,
        action: &str,
        address: &str,
        timestamp: i64,
    ) {
        datastore
            .update_lease(lease_params(action, MAC, address, timestamp))
            .await
            .unwrap();
    }

    fn mac() -> MacAddress {
        MAC.parse().unwrap()
    }

    async fn serial(datastore: &DataStore) -> i64 {
        datastore.dns_publication_latest_serial().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_update_lease_rejects_bad_events() {
        let logctx = dev::test_setup_log("test_update_lease_rejects_bad_events");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        setup(datastore).await;
        make_network(datastore, 11, "fd00::/64", "fd00::100", "fd00::1ff").await;

        let reject = |params| async move {
            match datastore.update_lease(params).await {
                Err(Error::LeaseUpdate(LeaseUpdateError(message))) => message,
                other => {
                    panic!("expected a lease update error, got {:?}", other)
                }
            }
        };

        assert_eq!(
            reject(lease_params("renew", MAC, "10.0.0.150", TIMESTAMP)).await,
            "Unknown lease action: renew"
        );
        assert_eq!(
            reject(lease_params("commit", MAC, "172.16.0.1", TIMESTAMP)).await,
            "No subnet exists for: 172.16.0.1"
        );

        let mut v4_as_v6 = lease_params("commit", MAC, "10.0.0.150", TIMESTAMP);
        v4_as_v6.ip_family = "ipv6".to_string();
        assert_eq!(
            reject(v4_as_v6).await,
            "Family for the subnet does not match. Expected: ipv6"
        );
        let mut v6_as_v4 = lease_params("commit", MAC, "fd00::150", TIMESTAMP);
        v6_as_v4.ip_family = "ipv4".to_string();
        assert_eq!(
            reject(v6_as_v4).await,
            "Family for the subnet does not match. Expected: ipv4"
        );

        // Nothing was applied along the way.
        assert!(datastore.interface_list_by_mac(&mac()).await.unwrap().is_empty());
        assert!(datastore.static_ip_address_list().await.unwrap().is_empty());

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_lease_outside_dynamic_range_is_ignored() {
        let logctx =
            dev::test_setup_log("test_lease_outside_dynamic_range_is_ignored");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        setup(datastore).await;

        commit(datastore, "10.0.0.20", TIMESTAMP, Some("host")).await;
        assert!(datastore.interface_list_by_mac(&mac()).await.unwrap().is_empty());
        assert!(datastore.static_ip_address_list().await.unwrap().is_empty());

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_expiry_for_unknown_mac_is_ignored() {
        let logctx = dev::test_setup_log("test_expiry_for_unknown_mac_is_ignored");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        setup(datastore).await;

        for _ in 0..3 {
            expire(datastore, "expiry", "10.0.0.150", TIMESTAMP).await;
            expire(datastore, "release", "10.0.0.150", TIMESTAMP).await;
        }
        assert!(datastore.interface_list_by_mac(&mac()).await.unwrap().is_empty());
        assert!(datastore.static_ip_address_list().await.unwrap().is_empty());

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_commit_for_unknown_mac_creates_interface() {
        let logctx =
            dev::test_setup_log("test_commit_for_unknown_mac_creates_interface");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;

        commit(datastore, "10.0.0.150", TIMESTAMP, None).await;
        commit(datastore, "10.0.0.150", TIMESTAMP + 60, None).await;

        let interfaces = datastore.interface_list_by_mac(&mac()).await.unwrap();
        assert_eq!(interfaces.len(), 1);
        let iface = &interfaces[0];
        assert_eq!(iface.name, UNKNOWN_INTERFACE_NAME);
        assert_eq!(iface.kind, InterfaceKind::Unknown);
        assert_eq!(iface.vlan_id, Some(net.vlan.id));
        assert_eq!(iface.node_id, None);

        let sips = discovered(datastore, iface).await;
        assert_eq!(sips.len(), 1);
        let sip = &sips[0];
        let timestamp = DateTime::from_timestamp(TIMESTAMP + 60, 0).unwrap();
        assert_eq!(sip.ip_addr(), Some(ip("10.0.0.150")));
        assert_eq!(sip.subnet_id, Some(net.subnet.id));
        assert_eq!(sip.lease_time, Some(600));
        assert_eq!(sip.created, timestamp);
        assert_eq!(sip.updated, timestamp);
        assert_eq!(datastore.static_ip_address_list().await.unwrap().len(), 1);

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_commit_keeps_one_address_per_family() {
        let logctx =
            dev::test_setup_log("test_commit_keeps_one_address_per_family");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        let net6 =
            make_network(datastore, 11, "fd00::/64", "fd00::100", "fd00::1ff")
                .await;
        let iface = physical(datastore, &net).await;
        let v6 = make_ip_address(
            datastore,
            IpAddressType::Discovered,
            Some("fd00::150"),
            &net6.subnet,
            &[iface.id],
        )
        .await;
        let sticky = make_ip_address(
            datastore,
            IpAddressType::Sticky,
            Some("10.0.0.5"),
            &net.subnet,
            &[iface.id],
        )
        .await;

        commit(datastore, "10.0.0.150", TIMESTAMP, None).await;
        commit(datastore, "10.0.0.151", TIMESTAMP + 1, None).await;
        commit(datastore, "10.0.0.152", TIMESTAMP + 2, None).await;

        let mut v4: Vec<_> = discovered(datastore, &iface).await
            .into_iter()
            .filter(|sip| sip.ip != v6.ip)
            .collect();
        assert_eq!(v4.len(), 1);
        let v4 = v4.remove(0);
        assert_eq!(v4.ip_addr(), Some(ip("10.0.0.152")));
        assert_eq!(
            v4.created,
            DateTime::from_timestamp(TIMESTAMP + 2, 0).unwrap()
        );

        // Addresses of the other family, and static ones, are untouched.
        assert_eq!(datastore.static_ip_address_lookup(v6.id).await.unwrap(), v6);
        let on_iface = datastore.interface_ip_addresses(iface.id).await.unwrap();
        assert!(on_iface.contains(&sticky));
        assert!(on_iface.contains(&v6));
        assert_eq!(on_iface.len(), 3);
        assert_eq!(datastore.static_ip_address_list().await.unwrap().len(), 3);

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_commit_links_every_interface_with_the_mac() {
        let logctx =
            dev::test_setup_log("test_commit_links_every_interface_with_the_mac");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        let node = datastore.node_create("bonded").await.unwrap();
        let member = make_interface(
            datastore,
            "eth0",
            InterfaceKind::Physical,
            MAC,
            Some(net.vlan.id),
            Some(node.id),
        )
        .await;
        let bond = make_interface(
            datastore,
            "bond0",
            InterfaceKind::Bond,
            MAC,
            Some(net.vlan.id),
            Some(node.id),
        )
        .await;

        commit(datastore, "10.0.0.150", TIMESTAMP, None).await;
        let on_member = discovered(datastore, &member).await;
        let on_bond = discovered(datastore, &bond).await;
        assert_eq!(on_member.len(), 1);
        assert_eq!(on_member, on_bond);
        assert_eq!(datastore.interface_list_by_mac(&mac()).await.unwrap().len(), 2);

        expire(datastore, "expiry", "10.0.0.150", TIMESTAMP + 10).await;
        let on_member = discovered(datastore, &member).await;
        assert_eq!(on_member.len(), 1);
        assert_eq!(on_member[0].ip_addr(), None);
        assert_eq!(on_member, discovered(datastore, &bond).await);

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_expiry_nulls_address_once() {
        let logctx = dev::test_setup_log("test_expiry_nulls_address_once");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        let iface = physical(datastore, &net).await;

        commit(datastore, "10.0.0.150", TIMESTAMP, None).await;
        let committed = discovered(datastore, &iface).await.remove(0);

        expire(datastore, "expiry", "10.0.0.150", TIMESTAMP + 10).await;
        expire(datastore, "expiry", "10.0.0.150", TIMESTAMP + 20).await;
        expire(datastore, "release", "10.0.0.150", TIMESTAMP + 30).await;

        let sips = discovered(datastore, &iface).await;
        assert_eq!(sips.len(), 1);
        let sip = &sips[0];
        assert_eq!(sip.id, committed.id);
        assert_eq!(sip.ip_addr(), None);
        assert_eq!(sip.subnet_id, Some(net.subnet.id));
        assert_eq!(sip.created, committed.created);
        assert_eq!(
            sip.updated,
            DateTime::from_timestamp(TIMESTAMP + 30, 0).unwrap()
        );

        // A new lease reuses the released row.
        commit(datastore, "10.0.0.160", TIMESTAMP + 40, None).await;
        let sips = discovered(datastore, &iface).await;
        assert_eq!(sips.len(), 1);
        assert_eq!(sips[0].id, committed.id);
        assert_eq!(sips[0].ip_addr(), Some(ip("10.0.0.160")));

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_expiry_without_address_records_subnet() {
        let logctx =
            dev::test_setup_log("test_expiry_without_address_records_subnet");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        let iface = physical(datastore, &net).await;

        expire(datastore, "release", "10.0.0.150", TIMESTAMP).await;
        expire(datastore, "release", "10.0.0.150", TIMESTAMP + 1).await;

        let sips = discovered(datastore, &iface).await;
        assert_eq!(sips.len(), 1);
        assert_eq!(sips[0].ip_addr(), None);
        assert_eq!(sips[0].subnet_id, Some(net.subnet.id));
        assert_eq!(
            sips[0].created,
            DateTime::from_timestamp(TIMESTAMP, 0).unwrap()
        );

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_duplicate_unassigned_addresses_are_collapsed() {
        let logctx = dev::test_setup_log(
            "test_duplicate_unassigned_addresses_are_collapsed",
        );
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        let iface = physical(datastore, &net).await;
        for _ in 0..3 {
            make_ip_address(
                datastore,
                IpAddressType::Discovered,
                None,
                &net.subnet,
                &[iface.id],
            )
            .await;
        }

        expire(datastore, "expiry", "10.0.0.150", TIMESTAMP).await;
        assert_eq!(discovered(datastore, &iface).await.len(), 1);
        assert_eq!(datastore.static_ip_address_list().await.unwrap().len(), 1);

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_commit_takes_address_from_previous_client() {
        let logctx =
            dev::test_setup_log("test_commit_takes_address_from_previous_client");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        let previous = make_interface(
            datastore,
            "eth1",
            InterfaceKind::Physical,
            "52:54:00:ff:ff:ff",
            Some(net.vlan.id),
            None,
        )
        .await;
        let old = make_ip_address(
            datastore,
            IpAddressType::Discovered,
            Some("10.0.0.150"),
            &net.subnet,
            &[previous.id],
        )
        .await;
        let iface = physical(datastore, &net).await;

        commit(datastore, "10.0.0.150", TIMESTAMP, None).await;
        let sips = discovered(datastore, &iface).await;
        assert_eq!(sips.len(), 1);
        assert_eq!(sips[0].id, old.id);
        assert!(discovered(datastore, &previous).await.is_empty());
        assert_eq!(datastore.static_ip_address_list().await.unwrap().len(), 1);

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_commit_publishes_hostname() {
        let logctx = dev::test_setup_log("test_commit_publishes_hostname");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        let iface = physical(datastore, &net).await;
        let before = serial(datastore).await;

        commit(datastore, "10.0.0.150", TIMESTAMP, Some("Living Room TV")).await;
        commit(datastore, "10.0.0.150", TIMESTAMP + 60, Some("Living Room TV")).await;

        let sip = discovered(datastore, &iface).await.remove(0);
        let resource = datastore
            .dns_resource_lookup_by_name("living-room-tv")
            .await
            .unwrap();
        assert_eq!(
            datastore.dns_resource_ip_addresses(resource.id).await.unwrap(),
            vec![sip]
        );
        let updates: Vec<_> = datastore
            .dns_publications_since(before)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.update)
            .collect();
        assert_eq!(updates, vec!["INSERT maas living-room-tv A 30 10.0.0.150"]);

        // Moving to another address takes the name along.
        commit(datastore, "10.0.0.151", TIMESTAMP + 120, Some("Living Room TV")).await;
        let updates: Vec<_> = datastore
            .dns_publications_since(before + 1)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.update)
            .collect();
        assert_eq!(
            updates,
            vec![
                "DELETE maas living-room-tv A",
                "INSERT maas living-room-tv A 30 10.0.0.151",
            ]
        );

        // Expiry unpublishes it.
        expire(datastore, "expiry", "10.0.0.151", TIMESTAMP + 180).await;
        assert_matches!(
            datastore.dns_resource_lookup_by_name("living-room-tv").await,
            Err(Error::ObjectNotFound { .. })
        );

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_commit_without_hostname_publishes_nothing() {
        let logctx =
            dev::test_setup_log("test_commit_without_hostname_publishes_nothing");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        physical(datastore, &net).await;
        let before = serial(datastore).await;

        commit(datastore, "10.0.0.150", TIMESTAMP, Some("(none)")).await;
        commit(datastore, "10.0.0.150", TIMESTAMP + 1, Some("  ")).await;
        commit(datastore, "10.0.0.150", TIMESTAMP + 2, None).await;
        assert_eq!(serial(datastore).await, before);

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_node_hostnames_are_not_shadowed() {
        let logctx = dev::test_setup_log("test_node_hostnames_are_not_shadowed");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        physical(datastore, &net).await;
        datastore.node_create("gaming-device").await.unwrap();
        let before = serial(datastore).await;

        commit(datastore, "10.0.0.150", TIMESTAMP, Some("gaming device")).await;
        assert_matches!(
            datastore.dns_resource_lookup_by_name("gaming-device").await,
            Err(Error::ObjectNotFound { .. })
        );
        assert_eq!(serial(datastore).await, before);

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_node_hostname_releases_dynamic_binding() {
        let logctx = dev::test_setup_log(
            "test_node_hostname_releases_dynamic_binding",
        );
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        physical(datastore, &net).await;

        commit(datastore, "10.0.0.150", TIMESTAMP, Some("laptop")).await;
        datastore.dns_resource_lookup_by_name("laptop").await.unwrap();
        let before = serial(datastore).await;

        // Once a node owns the name, the next commit takes it back from the
        // lease.
        datastore.node_create("laptop").await.unwrap();
        commit(datastore, "10.0.0.150", TIMESTAMP + 60, Some("laptop")).await;
        assert_matches!(
            datastore.dns_resource_lookup_by_name("laptop").await,
            Err(Error::ObjectNotFound { .. })
        );
        let updates: Vec<_> = datastore
            .dns_publications_since(before)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.update)
            .collect();
        assert_eq!(updates, vec!["DELETE maas laptop A"]);

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_internal_errors_name_the_lease() {
        let logctx =
            dev::test_setup_log("test_internal_errors_name_the_lease");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net = setup(datastore).await;
        physical(datastore, &net).await;

        // Publishing a hostname needs exactly one default domain.
        let conn = datastore.pool_connection().await.unwrap();
        diesel::insert_into(domain::table)
            .values((domain::name.eq("other"), domain::is_default.eq(true)))
            .execute_async(&*conn)
            .await
            .unwrap();
        drop(conn);

        let mut params = lease_params("commit", MAC, "10.0.0.150", TIMESTAMP);
        params.hostname = Some("laptop".to_string());
        assert_matches!(
            datastore.update_lease(params).await,
            Err(Error::InternalError { internal_message })
                if internal_message
                    == "commit lease for 10.0.0.150 on 52:54:00:12:34:56: \
                        looking up the default domain: \
                        found more than one default domain"
        );

        // Rejections are the caller's problem and carry no context.
        assert_eq!(
            datastore
                .update_lease(lease_params("renew", MAC, "10.0.0.150", 0))
                .await
                .unwrap_err(),
            Error::from(LeaseUpdateError::new("Unknown lease action: renew"))
        );

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_ipv6_lease() {
        let logctx = dev::test_setup_log("test_ipv6_lease");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore();
        let net =
            make_network(datastore, 11, "fd00::/64", "fd00::100", "fd00::1ff")
                .await;
        let iface = physical(datastore, &net).await;

        commit(datastore, "fd00::150", TIMESTAMP, Some("v6host")).await;
        let sip = discovered(datastore, &iface).await.remove(0);
        assert_eq!(sip.ip_addr(), Some(ip("fd00::150")));
        let latest =
            datastore.dns_publications_since(0).await.unwrap().pop().unwrap();
        assert_eq!(latest.update, "INSERT maas v6host AAAA 30 fd00::150");

        db.terminate().await;
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_lease_waits_for_subnet_configuration() {
        let logctx =
            dev::test_setup_log("test_lease_waits_for_subnet_configuration");
        let db = TestDatabase::new(&logctx).await;
        let datastore = db.datastore().clone();
        let net = setup(&datastore).await;
        let iface = physical(&datastore, &net).await;

        // Hold the lock exclusive, as a subnet change would, while a lease
        // event arrives.
        let config_conn = datastore.pool_connection().await.unwrap();
        let lease_datastore = datastore.clone();
        let lease = config_conn
            .transaction_async(|config| async move {
                assert!(locks::SUBNET_CONFIGURATION.acquire(&config).await?);
                let mut lease = tokio::spawn(async move {
                    lease_datastore
                        .update_lease(lease_params(
                            "commit",
                            MAC,
                            "10.0.0.150",
                            TIMESTAMP,
                        ))
                        .await
                });
                assert!(
                    tokio::time::timeout(Duration::from_millis(100), &mut lease)
                        .await
                        .is_err()
                );
                Ok::<_, TransactionError>(lease)
            })
            .await
            .unwrap();
        assert!(discovered(&datastore, &iface).await.is_empty());

        tokio::time::timeout(Duration::from_secs(10), lease)
            .await
            .expect("lease update did not finish")
            .unwrap()
            .unwrap();
        assert_eq!(discovered(&datastore, &iface).await.len(), 1);

        drop(config_conn);
        db.terminate().await;
        logctx.cleanup_successful();
    }
}
