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

//! Aggregation rule table.
//!
//! Loaded once at start. Attributes without an entry merge with
//! Replace. The table is data; deployments extend it alongside their
//! stat-table registrations.

use sandflow_core::{AggregationRule, RuleMap};

pub fn default_rules() -> RuleMap {
    RuleMap::from_entries(vec![
        // Interface and peer membership.
        (
            "VirtualNetworkAgent".into(),
            "interface_list".into(),
            AggregationRule::UnionList,
        ),
        (
            "VirtualNetworkAgent".into(),
            "connected_networks".into(),
            AggregationRule::UnionList,
        ),
        ("Stats".into(), "peers".into(), AggregationRule::UnionList),
        // Per-producer counters that sum across vRouters.
        ("Stats".into(), "tx_pkts".into(), AggregationRule::SumScalar),
        ("Stats".into(), "rx_pkts".into(), AggregationRule::SumScalar),
        (
            "VirtualNetworkAgent".into(),
            "in_bytes".into(),
            AggregationRule::SumScalar,
        ),
        (
            "VirtualNetworkAgent".into(),
            "out_bytes".into(),
            AggregationRule::SumScalar,
        ),
        (
            "UveVirtualNetworkAgent".into(),
            "vn_stats".into(),
            AggregationRule::SumStruct,
        ),
        // Interface stats lists merged by interface name.
        (
            "VrouterStatsAgent".into(),
            "if_stats_list".into(),
            AggregationRule::ListKeyMerge {
                key_field: "name".into(),
            },
        ),
        // Process status maps keyed by module instance.
        (
            "NodeStatus".into(),
            "process_info".into(),
            AggregationRule::UnionMap { value_rule: None },
        ),
        // Alarm history appends.
        (
            "UVEAlarms".into(),
            "alarms".into(),
            AggregationRule::AppendList,
        ),
    ])
}
