// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Advisory locks with a well-known meaning across the region.

use super::lock::DatabaseLock;
use super::lock::DatabaseXactLock;

/// Held while the database is being initialized.
pub const STARTUP: DatabaseLock = DatabaseLock::new(1);

/// Serializes changes to subnets and IP ranges against lease
/// reconciliation. Lease updates take it shared; configuration changes take
/// it exclusive.
pub const SUBNET_CONFIGURATION: DatabaseXactLock = DatabaseXactLock::new(2);
