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

//! Merge semantics properties: the incrementally maintained view must
//! equal a recompute from scratch, and commuting rules must be
//! arrival-order independent.

use proptest::prelude::*;
use sandflow_core::{
    AggregationRule, Contribution, EntityKey, MemCache, ProducerId, RuleMap, UveFragment,
};
use sandflow_uve::{merge_attribute, UveAggregator};
use serde_json::{json, Value};
use std::sync::Arc;

fn producer(i: u8) -> ProducerId {
    ProducerId::new(&format!("host{}", i), "Agent", "0", "Compute")
}

fn fragment(attr: &str, value: Option<Value>) -> UveFragment {
    UveFragment {
        object_type: "VirtualNetwork".into(),
        object_key: "vn1".into(),
        struct_name: "Stats".into(),
        attr_name: attr.into(),
        value,
    }
}

/// One randomized producer action against a single attribute.
#[derive(Debug, Clone)]
enum Action {
    Set { producer: u8, value: u64, at: u64 },
    Withdraw { producer: u8 },
    Disconnect { producer: u8 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0u8..4, 0u64..1000, 1u64..100).prop_map(|(producer, value, at)| Action::Set {
            producer,
            value,
            at
        }),
        (0u8..4).prop_map(|producer| Action::Withdraw { producer }),
        (0u8..4).prop_map(|producer| Action::Disconnect { producer }),
    ]
}

fn rules(rule: AggregationRule) -> Arc<RuleMap> {
    let mut map = RuleMap::new();
    map.insert("Stats", "x", rule);
    Arc::new(map)
}

proptest! {
    /// Property: after any action sequence, the aggregator's merged value
    /// equals merge_attribute applied to the surviving contribution set.
    #[test]
    fn incremental_update_equals_full_recompute(
        actions in proptest::collection::vec(action_strategy(), 1..40)
    ) {
        let rule = AggregationRule::SumScalar;
        let agg = UveAggregator::new(rules(rule.clone()), Arc::new(MemCache::new()));
        let entity = EntityKey::new("VirtualNetwork", "vn1");

        // Reference model: the surviving contribution per producer.
        let mut model: std::collections::BTreeMap<u8, (u64, u64)> = Default::default();

        for action in actions {
            match action {
                Action::Set { producer: p, value, at } => {
                    agg.update(&producer(p), &fragment("x", Some(json!(value))), at).unwrap();
                    model.insert(p, (value, at));
                }
                Action::Withdraw { producer: p } => {
                    agg.update(&producer(p), &fragment("x", None), 0).unwrap();
                    model.remove(&p);
                }
                Action::Disconnect { producer: p } => {
                    agg.producer_disconnected(&producer(p)).unwrap();
                    model.remove(&p);
                }
            }

            let contributions: Vec<Contribution> = model
                .iter()
                .map(|(p, (value, at))| Contribution {
                    producer: producer(*p),
                    value: json!(value),
                    received_at_usec: *at,
                })
                .collect();
            let expected = merge_attribute(&rule, &contributions).map(|m| m.value);
            let actual = agg.get_attr(&entity, "Stats", "x");
            prop_assert_eq!(actual, expected);
        }
    }

    /// Property: for commuting rules, the merged value is independent of
    /// arrival order across producers.
    #[test]
    fn commuting_rules_are_order_independent(
        values in proptest::collection::vec((0u8..6, 0u64..100), 2..8),
        rule_pick in 0usize..4,
    ) {
        let rule = match rule_pick {
            0 => AggregationRule::SumScalar,
            1 => AggregationRule::UnionList,
            2 => AggregationRule::UnionMap { value_rule: None },
            _ => AggregationRule::SumStruct,
        };

        let as_value = |rule: &AggregationRule, v: u64| -> Value {
            match rule {
                AggregationRule::SumScalar => json!(v),
                AggregationRule::UnionList => json!([v, v + 1]),
                AggregationRule::UnionMap { .. } => json!({ format!("k{}", v % 3): v }),
                _ => json!({ "a": v, "b": v * 2 }),
            }
        };

        // Deduplicate producers: one contribution per producer, as the
        // aggregator enforces.
        let mut seen = std::collections::BTreeMap::new();
        for (p, v) in &values {
            seen.insert(*p, *v);
        }

        let contributions: Vec<Contribution> = seen
            .iter()
            .map(|(p, v)| Contribution {
                producer: producer(*p),
                value: as_value(&rule, *v),
                received_at_usec: *v,
            })
            .collect();

        let forward = merge_attribute(&rule, &contributions).map(|m| m.value);
        let mut reversed = contributions.clone();
        reversed.reverse();
        let backward = merge_attribute(&rule, &reversed).map(|m| m.value);
        prop_assert_eq!(forward, backward);
    }
}
