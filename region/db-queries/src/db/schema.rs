// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes the Diesel database schema.
//!
//! NOTE: Should be kept up-to-date with schema/dbinit.sql.

table! {
    vlan (id) {
        id -> Int8,
        vid -> Int4,
        name -> Text,
    }
}

table! {
    subnet (id) {
        id -> Int8,
        name -> Text,
        cidr -> Inet,
        vlan_id -> Int8,
    }
}

table! {
    ip_range (id) {
        id -> Int8,
        subnet_id -> Int8,
        kind -> crate::db::model::IpRangeKindEnum,
        start_ip -> Inet,
        end_ip -> Inet,
    }
}

table! {
    node (id) {
        id -> Int8,
        hostname -> Text,
    }
}

table! {
    interface (id) {
        id -> Int8,
        name -> Text,
        kind -> crate::db::model::InterfaceKindEnum,
        mac_address -> MacAddr,
        vlan_id -> Nullable<Int8>,
        node_id -> Nullable<Int8>,
    }
}

table! {
    static_ip_address (id) {
        id -> Int8,
        ip -> Nullable<Inet>,
        alloc_type -> crate::db::model::IpAddressTypeEnum,
        subnet_id -> Nullable<Int8>,
        lease_time -> Nullable<Int4>,
        created -> Timestamptz,
        updated -> Timestamptz,
    }
}

table! {
    interface_ip_address (interface_id, static_ip_address_id) {
        interface_id -> Int8,
        static_ip_address_id -> Int8,
    }
}

table! {
    domain (id) {
        id -> Int8,
        name -> Text,
        ttl -> Nullable<Int4>,
        is_default -> Bool,
    }
}

table! {
    dns_resource (id) {
        id -> Int8,
        name -> Text,
        domain_id -> Int8,
        address_ttl -> Nullable<Int4>,
    }
}

table! {
    dns_resource_ip_address (dns_resource_id, static_ip_address_id) {
        dns_resource_id -> Int8,
        static_ip_address_id -> Int8,
    }
}

table! {
    dns_publication (id) {
        id -> Int8,
        serial -> Int8,
        created -> Timestamptz,
        source -> Text,
        update -> Text,
    }
}

joinable!(subnet -> vlan (vlan_id));
joinable!(ip_range -> subnet (subnet_id));
joinable!(interface_ip_address -> interface (interface_id));
joinable!(interface_ip_address -> static_ip_address (static_ip_address_id));
joinable!(dns_resource -> domain (domain_id));
joinable!(dns_resource_ip_address -> dns_resource (dns_resource_id));
joinable!(dns_resource_ip_address -> static_ip_address (static_ip_address_id));

allow_tables_to_appear_in_same_query!(
    vlan,
    subnet,
    ip_range,
    node,
    interface,
    static_ip_address,
    interface_ip_address,
    domain,
    dns_resource,
    dns_resource_ip_address,
    dns_publication,
);
