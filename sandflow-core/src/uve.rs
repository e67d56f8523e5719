// Copyright 2025 Sandflow (https://github.com/sandflow)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! UVE contribution types.
//!
//! A UVE (User-Visible Entity) is the merged live view of an object,
//! assembled from contributions made by many producers. The aggregator
//! holds at most one contribution per (producer, struct, attr); a newer
//! fragment from the same producer replaces the previous one.

use crate::message::ProducerId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a UVE.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub object_type: String,
    pub object_key: String,
}

impl EntityKey {
    pub fn new(object_type: &str, object_key: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_key: object_key.to_string(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_key)
    }
}

/// A single input to the merge for one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub producer: ProducerId,
    pub value: serde_json::Value,
    pub received_at_usec: u64,
}

/// One UVE state fragment as carried on the wire.
///
/// `value: None` withdraws this producer's contribution for the attribute
/// (the producer is retracting state it previously sent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UveFragment {
    pub object_type: String,
    pub object_key: String,
    pub struct_name: String,
    pub attr_name: String,
    pub value: Option<serde_json::Value>,
}

impl UveFragment {
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(&self.object_type, &self.object_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey::new("VirtualNetwork", "vn1");
        assert_eq!(key.to_string(), "VirtualNetwork:vn1");
    }

    #[test]
    fn test_fragment_entity_key() {
        let frag = UveFragment {
            object_type: "VirtualNetwork".into(),
            object_key: "vn1".into(),
            struct_name: "Stats".into(),
            attr_name: "tx_pkts".into(),
            value: Some(serde_json::json!(10)),
        };
        assert_eq!(frag.entity_key(), EntityKey::new("VirtualNetwork", "vn1"));
    }
}
