// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for working with the region database: the lease reconciler,
//! dynamic DNS bookkeeping and advisory locks.

pub mod db;
mod transaction_retry;

#[macro_use]
extern crate slog;
#[macro_use]
extern crate diesel;
