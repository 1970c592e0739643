// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Row types stored in the region database, and the lease event types that
//! cross the RPC boundary.

mod dns;
mod interface;
mod lease;
mod node;
mod static_ip_address;
mod subnet;

pub use dns::coerce_to_valid_hostname;
pub use dns::DnsPublication;
pub use dns::DnsResource;
pub use dns::DnsUpdate;
pub use dns::DnsUpdateAction;
pub use dns::Domain;
pub use dns::RecordType;
pub use interface::Interface;
pub use interface::InterfaceKind;
pub use interface::InvalidMacAddress;
pub use interface::MacAddress;
pub use interface::UNKNOWN_INTERFACE_NAME;
pub use lease::LeaseAction;
pub use lease::LeaseUpdate;
pub use lease::LeaseUpdateParams;
pub use node::Node;
pub use static_ip_address::IpAddressType;
pub use static_ip_address::StaticIpAddress;
pub use subnet::IpFamily;
pub use subnet::IpRange;
pub use subnet::IpRangeKind;
pub use subnet::Subnet;
pub use subnet::Vlan;

pub use interface::InterfaceKindEnum;
pub use static_ip_address::IpAddressTypeEnum;
pub use subnet::IpRangeKindEnum;

use diesel::backend::Backend;
use diesel::deserialize::{self, FromSql};
use diesel::pg::Pg;
use diesel::serialize::{self, ToSql};
use diesel::sql_types;
use serde::Deserialize;
use serde::Serialize;

// Every table is keyed by its own serial id type so that, say, a subnet id
// can never be handed to an interface lookup.
macro_rules! impl_serial_id {
    ($($name:ident),* $(,)?) => {
        $(
            #[derive(
                Clone,
                Copy,
                Debug,
                PartialEq,
                Eq,
                PartialOrd,
                Ord,
                Hash,
                AsExpression,
                FromSqlRow,
                Serialize,
                Deserialize,
            )]
            #[diesel(sql_type = sql_types::BigInt)]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl From<i64> for $name {
                fn from(id: i64) -> Self {
                    Self(id)
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl ToSql<sql_types::BigInt, Pg> for $name {
                fn to_sql<'a>(
                    &'a self,
                    out: &mut serialize::Output<'a, '_, Pg>,
                ) -> serialize::Result {
                    <i64 as ToSql<sql_types::BigInt, Pg>>::to_sql(
                        &self.0,
                        &mut out.reborrow(),
                    )
                }
            }

            impl<DB> FromSql<sql_types::BigInt, DB> for $name
            where
                DB: Backend,
                i64: FromSql<sql_types::BigInt, DB>,
            {
                fn from_sql(bytes: DB::RawValue<'_>) -> deserialize::Result<Self> {
                    i64::from_sql(bytes).map($name)
                }
            }
        )*
    };
}

impl_serial_id!(
    VlanId,
    SubnetId,
    IpRangeId,
    NodeId,
    InterfaceId,
    StaticIpAddressId,
    DomainId,
    DnsResourceId,
    DnsPublicationId,
);

/// Declares a PostgreSQL enum type along with the model enum stored in it.
///
/// Each variant is written to the database as the byte string given for it,
/// which must match a label of the `CREATE TYPE` in dbinit.sql.
macro_rules! impl_enum_type {
    (
        $(#[$enum_meta:meta])*
        pub struct $diesel_type:ident;

        $(#[$model_meta:meta])*
        pub enum $model_type:ident;

        $($enum_item:ident => $sql_value:literal)+
    ) => {
        $(#[$enum_meta])*
        pub struct $diesel_type;

        $(#[$model_meta])*
        pub enum $model_type {
            $(
                $enum_item,
            )*
        }

        impl ::diesel::serialize::ToSql<$diesel_type, ::diesel::pg::Pg> for $model_type {
            fn to_sql<'a>(
                &'a self,
                out: &mut ::diesel::serialize::Output<'a, '_, ::diesel::pg::Pg>,
            ) -> ::diesel::serialize::Result {
                use ::std::io::Write;
                match self {
                    $(
                    $model_type::$enum_item => {
                        out.write_all($sql_value)?
                    }
                    )*
                }
                Ok(::diesel::serialize::IsNull::No)
            }
        }

        impl ::diesel::deserialize::FromSql<$diesel_type, ::diesel::pg::Pg> for $model_type {
            fn from_sql(bytes: <::diesel::pg::Pg as ::diesel::backend::Backend>::RawValue<'_>) -> ::diesel::deserialize::Result<Self> {
                match <::diesel::pg::Pg as ::diesel::backend::Backend>::RawValue::<'_>::as_bytes(&bytes) {
                    $(
                    $sql_value => {
                        Ok($model_type::$enum_item)
                    }
                    )*
                    other => {
                        let s = concat!("Unrecognized enum variant for ", stringify!{$model_type});
                        Err(format!("{}: (raw bytes: {:?})", s, other).into())
                    }
                }
            }
        }
    }
}

pub(crate) use impl_enum_type;
