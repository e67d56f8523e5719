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

//! Stat samples for registered stats tables.
//!
//! The set of tag columns per table is declared at registration; the
//! indexer uses the tag values for partition pruning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A measured scalar, typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Unsigned(u64),
    Signed(i64),
    Double(f64),
    Text(String),
}

impl StatValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StatValue::Unsigned(v) => Some(*v as f64),
            StatValue::Signed(v) => Some(*v as f64),
            StatValue::Double(v) => Some(*v),
            StatValue::Text(_) => None,
        }
    }
}

/// One sample destined for a stats table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSample {
    /// Registered table name, e.g. "StatTable.NodeStatus.process_mem_cpu_usage".
    pub table_name: String,
    pub timestamp_usec: u64,
    /// Tag values keyed by tag column name. Must cover the table's declared
    /// tag columns; extras are ignored by the indexer.
    pub tags: BTreeMap<String, String>,
    pub values: BTreeMap<String, StatValue>,
}

impl StatSample {
    /// Tag values in the order of the declared tag columns, used to build
    /// the partition key. Missing tags yield None.
    pub fn tag_values(&self, declared: &[String]) -> Option<Vec<&str>> {
        declared
            .iter()
            .map(|name| self.tags.get(name).map(|v| v.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_values_follow_declaration_order() {
        let mut tags = BTreeMap::new();
        tags.insert("name".to_string(), "vn1".to_string());
        tags.insert("host".to_string(), "h1".to_string());
        let sample = StatSample {
            table_name: "StatTable.Test.t".into(),
            timestamp_usec: 1,
            tags,
            values: BTreeMap::new(),
        };

        let declared = vec!["name".to_string(), "host".to_string()];
        assert_eq!(sample.tag_values(&declared), Some(vec!["vn1", "h1"]));

        let missing = vec!["name".to_string(), "absent".to_string()];
        assert_eq!(sample.tag_values(&missing), None);
    }

    #[test]
    fn test_stat_value_as_f64() {
        assert_eq!(StatValue::Unsigned(4).as_f64(), Some(4.0));
        assert_eq!(StatValue::Signed(-2).as_f64(), Some(-2.0));
        assert_eq!(StatValue::Double(0.5).as_f64(), Some(0.5));
        assert_eq!(StatValue::Text("x".into()).as_f64(), None);
    }
}
