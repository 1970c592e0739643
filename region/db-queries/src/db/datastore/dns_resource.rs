// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`DataStore`] methods on [`DnsResource`]s, including the dynamic
//! hostnames derived from DHCP leases.
//!
//! A discovered address is published under the hostname its DHCP client
//! reported, in the default domain. Names that operators assigned to static
//! addresses win: a dynamic address is never added to a resource that has
//! more static than dynamic addresses.

use super::DataStore;
use crate::db::error::CreateResult;
use crate::db::error::Error;
use crate::db::error::ErrorHandler;
use crate::db::error::ListResult;
use crate::db::error::LookupResult;
use crate::db::error::ResourceType;
use crate::db::error::TransactionError;
use crate::db::model::coerce_to_valid_hostname;
use crate::db::model::DnsResource;
use crate::db::model::DnsResourceId;
use crate::db::model::DnsUpdate;
use crate::db::model::DomainId;
use crate::db::model::IpAddressType;
use crate::db::model::RecordType;
use crate::db::model::StaticIpAddress;
use crate::db::model::StaticIpAddressId;
use crate::db::pool::DbConnection;
use crate::db::schema::{dns_resource, dns_resource_ip_address};
use crate::db::schema::static_ip_address;
use async_bb8_diesel::AsyncRunQueryDsl;
use diesel::prelude::*;

impl DataStore {
    /// Creates a resource named `name` in the default domain, linked to
    /// `sip_ids`.
    pub async fn dns_resource_create(
        &self,
        name: &str,
        address_ttl: Option<u32>,
        sip_ids: &[StaticIpAddressId],
    ) -> CreateResult<DnsResource> {
        if coerce_to_valid_hostname(name).as_deref() != Some(name) {
            return Err(Error::invalid_request(&format!(
                "{:?} is not a valid DNS label",
                name
            )));
        }
        let address_ttl = address_ttl
            .map(i32::try_from)
            .transpose()
            .map_err(|_| Error::invalid_request("TTL is out of range"))?;
        self.transaction("dns_resource_create", |conn| async move {
            let domain = self.domain_fetch_default(&conn).await?;
            if self.dns_resource_find(&conn, domain.id, name).await?.is_some() {
                return Err(Error::already_exists(
                    ResourceType::DnsResource,
                    format!("{}.{}", name, domain.name),
                )
                .into());
            }
            for sip_id in sip_ids {
                self.static_ip_address_fetch(&conn, *sip_id).await?;
            }
            let resource = self
                .dns_resource_insert(&conn, name, domain.id, address_ttl)
                .await?;
            for sip_id in sip_ids {
                self.dns_resource_link_ip_address(&conn, resource.id, *sip_id)
                    .await?;
            }
            Ok(resource)
        })
        .await
    }

    async fn dns_resource_insert(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        name: &str,
        domain_id: DomainId,
        address_ttl: Option<i32>,
    ) -> Result<DnsResource, TransactionError> {
        diesel::insert_into(dns_resource::table)
            .values((
                dns_resource::name.eq(name.to_string()),
                dns_resource::domain_id.eq(domain_id),
                dns_resource::address_ttl.eq(address_ttl),
            ))
            .returning(DnsResource::as_returning())
            .get_result_async(conn)
            .await
            .map_err(|e| {
                TransactionError::from_diesel(
                    e,
                    ErrorHandler::Conflict(ResourceType::DnsResource, name),
                )
            })
    }

    async fn dns_resource_link_ip_address(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        dnsrr_id: DnsResourceId,
        sip_id: StaticIpAddressId,
    ) -> Result<(), TransactionError> {
        diesel::insert_into(dns_resource_ip_address::table)
            .values((
                dns_resource_ip_address::dns_resource_id.eq(dnsrr_id),
                dns_resource_ip_address::static_ip_address_id.eq(sip_id),
            ))
            .on_conflict_do_nothing()
            .execute_async(conn)
            .await?;
        Ok(())
    }

    async fn dns_resource_find(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        domain_id: DomainId,
        name: &str,
    ) -> Result<Option<DnsResource>, TransactionError> {
        let resource = dns_resource::table
            .filter(dns_resource::domain_id.eq(domain_id))
            .filter(dns_resource::name.eq(name.to_string()))
            .select(DnsResource::as_select())
            .get_result_async(conn)
            .await
            .optional()?;
        Ok(resource)
    }

    /// Looks up `name` in the default domain.
    pub async fn dns_resource_lookup_by_name(
        &self,
        name: &str,
    ) -> LookupResult<DnsResource> {
        let conn = self.pool_connection().await?;
        let domain = self.domain_fetch_default(&conn).await?;
        self.dns_resource_find(&conn, domain.id, name).await?.ok_or_else(
            || {
                Error::not_found(
                    ResourceType::DnsResource,
                    format!("{}.{}", name, domain.name),
                )
            },
        )
    }

    // The addresses linked to `dnsrr_id`, oldest first.
    async fn dns_resource_addresses(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        dnsrr_id: DnsResourceId,
    ) -> Result<Vec<StaticIpAddress>, TransactionError> {
        let addresses = dns_resource_ip_address::table
            .inner_join(static_ip_address::table)
            .filter(dns_resource_ip_address::dns_resource_id.eq(dnsrr_id))
            .order(static_ip_address::id)
            .select(StaticIpAddress::as_select())
            .load_async(conn)
            .await?;
        Ok(addresses)
    }

    pub async fn dns_resource_ip_addresses(
        &self,
        dnsrr_id: DnsResourceId,
    ) -> ListResult<StaticIpAddress> {
        let conn = self.pool_connection().await?;
        Ok(self.dns_resource_addresses(&conn, dnsrr_id).await?)
    }

    /// Unpublishes the dynamic hostnames of a discovered address.
    ///
    /// The address is unlinked from every resource of the default domain
    /// except the one named `but_not_for`. A resource left with no
    /// addresses is deleted. Addresses that are not discovered, or hold no
    /// IP, are left alone.
    pub async fn release_dynamic_hostname(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        sip_id: StaticIpAddressId,
        but_not_for: Option<&str>,
    ) -> Result<(), TransactionError> {
        let sip = self.static_ip_address_fetch(conn, sip_id).await?;
        let Some(ip) = sip.ip_addr() else {
            return Ok(());
        };
        if sip.alloc_type != IpAddressType::Discovered {
            return Ok(());
        }
        let domain = self.domain_fetch_default(conn).await?;
        let resources: Vec<DnsResource> = dns_resource_ip_address::table
            .inner_join(dns_resource::table)
            .filter(dns_resource_ip_address::static_ip_address_id.eq(sip_id))
            .filter(dns_resource::domain_id.eq(domain.id))
            .order(dns_resource::id)
            .select(DnsResource::as_select())
            .load_async(conn)
            .await?;

        for resource in resources {
            if Some(resource.name.as_str()) == but_not_for {
                continue;
            }
            diesel::delete(dns_resource_ip_address::table)
                .filter(dns_resource_ip_address::dns_resource_id.eq(resource.id))
                .filter(dns_resource_ip_address::static_ip_address_id.eq(sip_id))
                .execute_async(conn)
                .await?;
            let orphaned = !diesel::select(diesel::dsl::exists(
                dns_resource_ip_address::table.filter(
                    dns_resource_ip_address::dns_resource_id.eq(resource.id),
                ),
            ))
            .get_result_async::<bool>(conn)
            .await?;
            if orphaned {
                diesel::delete(dns_resource::table)
                    .filter(dns_resource::id.eq(resource.id))
                    .execute_async(conn)
                    .await?;
                self.dns_publication_record(
                    conn,
                    format!(
                        "zone {} removed resource {}",
                        domain.name, resource.name
                    ),
                    &DnsUpdate::delete_name(
                        &domain.name,
                        &resource.name,
                        RecordType::for_ip(&ip),
                    ),
                )
                .await?;
            } else {
                self.dns_publication_record(
                    conn,
                    format!(
                        "ip {} unlinked from resource {} on zone {}",
                        ip, resource.name, domain.name
                    ),
                    &DnsUpdate::delete_ip(&domain.name, &resource.name, &ip),
                )
                .await?;
            }
            info!(
                &self.log,
                "released dynamic hostname";
                "ip" => %ip,
                "hostname" => &resource.name,
                "resource_deleted" => orphaned,
            );
        }
        Ok(())
    }

    /// Publishes a discovered address under `hostname`.
    ///
    /// Any other dynamic hostname of the address is released first. Nothing
    /// is published if the address already belongs to the resource, or if
    /// the name is claimed by static addresses. A hostname that does not
    /// coerce to a DNS label only releases.
    pub async fn update_dynamic_hostname(
        &self,
        conn: &async_bb8_diesel::Connection<DbConnection>,
        sip_id: StaticIpAddressId,
        hostname: &str,
    ) -> Result<(), TransactionError> {
        let sip = self.static_ip_address_fetch(conn, sip_id).await?;
        let Some(ip) = sip.ip_addr() else {
            return Ok(());
        };
        if sip.alloc_type != IpAddressType::Discovered {
            return Ok(());
        }
        let Some(hostname) = coerce_to_valid_hostname(hostname) else {
            return self.release_dynamic_hostname(conn, sip_id, None).await;
        };
        self.release_dynamic_hostname(conn, sip_id, Some(&hostname)).await?;

        let domain = self.domain_fetch_default(conn).await?;
        let resource =
            match self.dns_resource_find(conn, domain.id, &hostname).await? {
                Some(resource) => {
                    let linked =
                        self.dns_resource_addresses(conn, resource.id).await?;
                    let static_links =
                        linked.iter().filter(|s| s.alloc_type.is_static()).count();
                    let dynamic_links = linked.len() - static_links;
                    if static_links > dynamic_links {
                        debug!(
                            &self.log,
                            "hostname is claimed by static addresses";
                            "ip" => %ip,
                            "hostname" => &hostname,
                        );
                        return Ok(());
                    }
                    if linked.iter().any(|s| s.id == sip_id) {
                        return Ok(());
                    }
                    resource
                }
                None => {
                    self.dns_resource_insert(conn, &hostname, domain.id, None)
                        .await?
                }
            };

        self.dns_resource_link_ip_address(conn, resource.id, sip_id).await?;
        let ttl = resource
            .address_ttl
            .or(domain.ttl)
            .and_then(|ttl| u32::try_from(ttl).ok())
            .unwrap_or(self.dns_config.default_ttl);
        self.dns_publication_record(
            conn,
            format!(
                "ip {} linked to resource {} on zone {}",
                ip, resource.name, domain.name
            ),
            &DnsUpdate::insert(&domain.name, &resource.name, &ip, ttl),
        )
        .await?;
        info!(
            &self.log,
            "published dynamic hostname";
            "ip" => %ip,
            "hostname" => &resource.name,
        );
        Ok(())
    }
}
