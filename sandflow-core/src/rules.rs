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

//! Aggregation rules for UVE attributes.
//!
//! Rules are static, keyed by (struct_name, attr_name), and loaded at
//! start. Unknown attributes default to `Replace`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How contributions for one attribute combine into the merged value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "rule")]
pub enum AggregationRule {
    /// Single contribution wins: greatest received_at, ties broken by
    /// lexicographic producer id.
    Replace,
    /// Integer/float sum across contributions; saturating on overflow.
    SumScalar,
    /// Field-wise SumScalar over structs of identical shape; missing
    /// fields are zero.
    SumStruct,
    /// Set union by deep equality, order-stable by first-seen.
    UnionList,
    /// Key union; collisions resolved by the declared value rule
    /// (Replace when undeclared).
    UnionMap {
        #[serde(default)]
        value_rule: Option<Box<AggregationRule>>,
    },
    /// Concatenation in producer-id order.
    AppendList,
    /// List of structs consolidated by a key field; scalars summed,
    /// everything else Replace.
    #[serde(rename = "listkey_merge")]
    ListKeyMerge { key_field: String },
}

/// The rule table, loaded once at start.
#[derive(Debug, Clone, Default)]
pub struct RuleMap {
    rules: HashMap<(String, String), AggregationRule>,
}

impl RuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from (struct_name, attr_name, rule) entries. Later entries
    /// for the same key win, matching "last definition loaded".
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String, AggregationRule)>,
    {
        let mut rules = HashMap::new();
        for (s, a, r) in entries {
            rules.insert((s, a), r);
        }
        Self { rules }
    }

    pub fn insert(&mut self, struct_name: &str, attr_name: &str, rule: AggregationRule) {
        self.rules
            .insert((struct_name.to_string(), attr_name.to_string()), rule);
    }

    /// Rule for an attribute; Replace when undeclared.
    pub fn rule_for(&self, struct_name: &str, attr_name: &str) -> &AggregationRule {
        self.rules
            .get(&(struct_name.to_string(), attr_name.to_string()))
            .unwrap_or(&AggregationRule::Replace)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
