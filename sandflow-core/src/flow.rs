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

//! Flow records.
//!
//! Flows are stored twice: as point samples in the series table and as a
//! "last seen" record keyed by flow uuid.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction relative to the virtual network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    Ingress,
    Egress,
}

/// The 8-tuple identifying a flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTuple {
    pub source_vn: String,
    pub dest_vn: String,
    pub source_ip: String,
    pub dest_ip: String,
    pub sport: u16,
    pub dport: u16,
    pub protocol: u8,
    pub direction: FlowDirection,
}

/// One flow sample as emitted by a vRouter agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSample {
    pub flow_uuid: Uuid,
    pub timestamp_usec: u64,
    pub tuple: FlowTuple,
    pub packets: u64,
    pub bytes: u64,
}

impl FlowSample {
    /// Value of a tuple or counter field by column name, for select lists
    /// and predicate evaluation. Unknown columns return None.
    pub fn column(&self, name: &str) -> Option<serde_json::Value> {
        use serde_json::json;
        match name {
            "flow_uuid" => Some(json!(self.flow_uuid.to_string())),
            "sourcevn" => Some(json!(self.tuple.source_vn)),
            "destvn" => Some(json!(self.tuple.dest_vn)),
            "sourceip" => Some(json!(self.tuple.source_ip)),
            "destip" => Some(json!(self.tuple.dest_ip)),
            "sport" => Some(json!(self.tuple.sport)),
            "dport" => Some(json!(self.tuple.dport)),
            "protocol" => Some(json!(self.tuple.protocol)),
            "direction" => Some(json!(match self.tuple.direction {
                FlowDirection::Ingress => "ingress",
                FlowDirection::Egress => "egress",
            })),
            "packets" => Some(json!(self.packets)),
            "bytes" => Some(json!(self.bytes)),
            "T" => Some(json!(self.timestamp_usec)),
            _ => None,
        }
    }
}
