// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::NodeId;
use crate::db::schema::node;
use serde::Deserialize;
use serde::Serialize;

/// A machine, device or controller known to the region.
#[derive(
    Queryable, Selectable, Clone, Debug, PartialEq, Eq, Deserialize, Serialize,
)]
#[diesel(table_name = node)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
}
