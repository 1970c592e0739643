// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for working with the region database

mod config;
// This is marked public for use by the RPC crate and integration tests
pub mod datastore;
pub mod error;
pub mod lock;
pub mod locks;
pub mod model;
pub(crate) mod pool;
mod schema;

pub use config::DatabaseConfig;
pub use config::DnsConfig;
pub use datastore::DataStore;
pub use pool::Connection;
pub use pool::DataStoreConnection;
pub use pool::DbConnection;
pub use pool::Pool;
pub use pool::SessionId;
