// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The region-facing end of region/rack communication: accepts lease events
//! from rack controllers and tracks the connections back to them.

pub mod config;
pub mod registry;
pub mod service;

pub use config::Config;
pub use config::LoadError;
pub use registry::ConnectionRegistry;
pub use registry::RackClient;
pub use registry::RackConnection;
pub use registry::RegistryError;
pub use registry::RegistryEvent;
pub use service::RegionService;
pub use service::RpcFault;
pub use service::StartError;
pub use service::UpdateLeaseResponse;

#[macro_use]
extern crate slog;
