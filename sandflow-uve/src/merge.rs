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

//! Aggregation rule evaluation.
//!
//! `merge_attribute` is a pure function of the contribution set and the
//! rule, so an incremental recompute of one attribute equals a recompute
//! from scratch. Contribution order is normalized internally; callers
//! can pass contributions in any order.

use sandflow_core::{AggregationRule, Contribution};
use serde_json::{Map, Number, Value};

/// Result of merging one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedValue {
    pub value: Value,
    /// A scalar sum saturated; the aggregator logs this once per entity.
    pub overflowed: bool,
}

impl MergedValue {
    fn clean(value: Value) -> Self {
        Self {
            value,
            overflowed: false,
        }
    }
}

/// Merge every contribution for one attribute under `rule`.
/// Returns None when the contribution set is empty.
pub fn merge_attribute(rule: &AggregationRule, contributions: &[Contribution]) -> Option<MergedValue> {
    if contributions.is_empty() {
        return None;
    }

    // Normalize: producer-id order for list semantics, and a stable base
    // for every other rule.
    let mut by_producer: Vec<&Contribution> = contributions.iter().collect();
    by_producer.sort_by(|a, b| a.producer.cmp(&b.producer));

    Some(match rule {
        AggregationRule::Replace => MergedValue::clean(replace(&by_producer)),
        AggregationRule::SumScalar => sum_scalar(by_producer.iter().map(|c| &c.value)),
        AggregationRule::SumStruct => sum_struct(&by_producer),
        AggregationRule::UnionList => MergedValue::clean(union_list(&by_producer)),
        AggregationRule::UnionMap { value_rule } => union_map(&by_producer, value_rule.as_deref()),
        AggregationRule::AppendList => MergedValue::clean(append_list(&by_producer)),
        AggregationRule::ListKeyMerge { key_field } => listkey_merge(&by_producer, key_field),
    })
}

/// Greatest received_at wins; ties broken by lexicographic producer id.
fn replace(contributions: &[&Contribution]) -> Value {
    contributions
        .iter()
        .max_by(|a, b| {
            a.received_at_usec
                .cmp(&b.received_at_usec)
                .then_with(|| a.producer.cmp(&b.producer))
        })
        .map(|c| c.value.clone())
        .unwrap_or(Value::Null)
}

/// Numeric sum with type preservation: u64 when every input is an
/// unsigned integer, i64 when any is negative, f64 when any is a float.
fn sum_scalar<'a>(values: impl Iterator<Item = &'a Value>) -> MergedValue {
    let values: Vec<&Value> = values.collect();
    let any_float = values.iter().any(|v| v.as_u64().is_none() && v.as_i64().is_none());
    let any_signed = values.iter().any(|v| v.as_u64().is_none() && v.as_i64().is_some());

    if any_float {
        let sum: f64 = values.iter().filter_map(|v| v.as_f64()).sum();
        return MergedValue::clean(
            Number::from_f64(sum)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
    }

    if any_signed {
        let mut sum = 0i64;
        let mut overflowed = false;
        for v in values.iter().filter_map(|v| v.as_i64()) {
            match sum.checked_add(v) {
                Some(s) => sum = s,
                None => {
                    sum = sum.saturating_add(v);
                    overflowed = true;
                }
            }
        }
        return MergedValue {
            value: Value::Number(sum.into()),
            overflowed,
        };
    }

    let mut sum = 0u64;
    let mut overflowed = false;
    for v in values.iter().filter_map(|v| v.as_u64()) {
        match sum.checked_add(v) {
            Some(s) => sum = s,
            None => {
                sum = u64::MAX;
                overflowed = true;
            }
        }
    }
    MergedValue {
        value: Value::Number(sum.into()),
        overflowed,
    }
}

/// Field-wise scalar sum over structs; missing fields are zero, and
/// non-object contributions are ignored.
fn sum_struct(contributions: &[&Contribution]) -> MergedValue {
    let mut fields: Vec<String> = Vec::new();
    for c in contributions {
        if let Value::Object(map) = &c.value {
            for key in map.keys() {
                if !fields.contains(key) {
                    fields.push(key.clone());
                }
            }
        }
    }
    fields.sort();

    let zero = Value::Number(0.into());
    let mut result = Map::new();
    let mut overflowed = false;
    for field in fields {
        let merged = sum_scalar(contributions.iter().filter_map(|c| match &c.value {
            Value::Object(map) => Some(map.get(&field).unwrap_or(&zero)),
            _ => None,
        }));
        overflowed |= merged.overflowed;
        result.insert(field, merged.value);
    }
    MergedValue {
        value: Value::Object(result),
        overflowed,
    }
}

/// Set union by deep equality, order-stable by first-seen in producer-id
/// order.
fn union_list(contributions: &[&Contribution]) -> Value {
    let mut out: Vec<Value> = Vec::new();
    for c in contributions {
        if let Value::Array(items) = &c.value {
            for item in items {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
        }
    }
    Value::Array(out)
}

/// Key union; colliding keys resolve by the declared value rule
/// (Replace when undeclared).
fn union_map(contributions: &[&Contribution], value_rule: Option<&AggregationRule>) -> MergedValue {
    let value_rule = value_rule.unwrap_or(&AggregationRule::Replace);

    let mut keys: Vec<String> = Vec::new();
    for c in contributions {
        if let Value::Object(map) = &c.value {
            for key in map.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
    }
    keys.sort();

    let mut result = Map::new();
    let mut overflowed = false;
    for key in keys {
        // Each colliding value keeps its contribution's identity so the
        // value rule's tie-breaks still apply.
        let per_key: Vec<Contribution> = contributions
            .iter()
            .filter_map(|c| match &c.value {
                Value::Object(map) => map.get(&key).map(|v| Contribution {
                    producer: c.producer.clone(),
                    value: v.clone(),
                    received_at_usec: c.received_at_usec,
                }),
                _ => None,
            })
            .collect();
        if let Some(merged) = merge_attribute(value_rule, &per_key) {
            overflowed |= merged.overflowed;
            result.insert(key, merged.value);
        }
    }
    MergedValue {
        value: Value::Object(result),
        overflowed,
    }
}

/// Concatenation in producer-id order.
fn append_list(contributions: &[&Contribution]) -> Value {
    let mut out: Vec<Value> = Vec::new();
    for c in contributions {
        if let Value::Array(items) = &c.value {
            out.extend(items.iter().cloned());
        }
    }
    Value::Array(out)
}

/// Consolidate lists of structs by `key_field`: scalar fields of matching
/// entries are summed, non-scalar fields follow Replace (the contribution
/// with the greatest received_at wins).
fn listkey_merge(contributions: &[&Contribution], key_field: &str) -> MergedValue {
    // Ascending (received_at, producer) so a plain overwrite leaves the
    // greatest pair in place.
    let mut ordered: Vec<&Contribution> = contributions.to_vec();
    ordered.sort_by(|a, b| {
        a.received_at_usec
            .cmp(&b.received_at_usec)
            .then_with(|| a.producer.cmp(&b.producer))
    });

    let mut entry_keys: Vec<Value> = Vec::new();
    let mut entries: Vec<Map<String, Value>> = Vec::new();
    let mut overflowed = false;

    for c in &ordered {
        let Value::Array(items) = &c.value else {
            continue;
        };
        for item in items {
            let Value::Object(fields) = item else {
                continue;
            };
            let Some(entry_key) = fields.get(key_field) else {
                continue;
            };

            match entry_keys.iter().position(|k| k == entry_key) {
                None => {
                    entry_keys.push(entry_key.clone());
                    entries.push(fields.clone());
                }
                Some(pos) => {
                    let existing = &mut entries[pos];
                    for (name, value) in fields {
                        if name == key_field {
                            continue;
                        }
                        match existing.get(name) {
                            Some(current) if current.is_number() && value.is_number() => {
                                let merged =
                                    sum_scalar([current, value].into_iter());
                                overflowed |= merged.overflowed;
                                existing.insert(name.clone(), merged.value);
                            }
                            _ => {
                                existing.insert(name.clone(), value.clone());
                            }
                        }
                    }
                }
            }
        }
    }

    MergedValue {
        value: Value::Array(entries.into_iter().map(Value::Object).collect()),
        overflowed,
    }
}
