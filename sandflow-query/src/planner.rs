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

//! Query planning.
//!
//! For message queries each AND group picks its most selective index
//! (Eq/In beat LIKE-prefix, then a static cardinality rank); a group
//! with no indexed predicate falls back to the timestamp index. The
//! where clause is re-evaluated in full after point reads, so an index
//! only ever narrows the candidate set, never decides membership.

use crate::model::{Predicate, PredicateOp, Query};
use sandflow_core::{partition_range, Result, SandflowError, TableFamily};
use sandflow_store::{
    encode_parts, fmt_t, fmt_ts, prefix_upper_bound, CkRange, IndexColumn, SystemState, TableKind,
    TableRegistry, KEY_SEP, MESSAGE_TABLE_TIMESTAMP,
};
use serde_json::Value;

/// What a scan's rows decode into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanYield {
    /// Index row: clustering (value, ts, uuid) or (ts, uuid).
    IndexUuid,
    FlowSeries,
    FlowRecord,
    Stats,
    ObjectValue,
}

/// One bounded partition-range scan.
#[derive(Debug, Clone)]
pub struct ScanNode {
    pub table: String,
    pub partitions: Vec<String>,
    pub ck_range: CkRange,
    pub yields: ScanYield,
}

#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub nodes: Vec<ScanNode>,
    pub family: TableFamily,
    /// Message queries resolve uuids against the message table.
    pub needs_point_read: bool,
}

/// Static cardinality rank used to break index-choice ties; higher is
/// more selective.
fn index_rank(column: IndexColumn) -> u8 {
    match column {
        IndexColumn::ObjectId => 6,
        IndexColumn::Keyword => 5,
        IndexColumn::MessageType => 4,
        IndexColumn::Category => 3,
        IndexColumn::ModuleId => 2,
        IndexColumn::Source => 1,
    }
}

pub fn plan(query: &Query, registry: &TableRegistry, system: &SystemState) -> Result<QueryPlan> {
    let def = registry
        .get(&query.table)
        .ok_or_else(|| SandflowError::UnsupportedPredicate(format!("unknown table '{}'", query.table)))?;

    let family = def.family;
    let epoch = system.epoch(family);
    if query.start_time_usec < epoch {
        return Err(SandflowError::BelowRetention {
            start_usec: query.start_time_usec,
            epoch_usec: epoch,
        });
    }

    validate_predicates(query, &def.kind)?;

    let bits = registry.partition_bits();
    let partitions: Vec<String> =
        partition_range(query.start_time_usec, query.end_time_usec, bits)
            .map(fmt_t)
            .collect();

    let ts_range = CkRange::between(
        &fmt_ts(query.start_time_usec),
        &prefix_upper_bound(&fmt_ts(query.end_time_usec)),
    );

    let plan = match &def.kind {
        TableKind::Message => plan_message(query, registry, partitions, family)?,
        TableKind::FlowSeries => QueryPlan {
            nodes: vec![ScanNode {
                table: def.name.clone(),
                partitions,
                ck_range: ts_range,
                yields: ScanYield::FlowSeries,
            }],
            family,
            needs_point_read: false,
        },
        TableKind::FlowRecord => plan_flow_record(query, &def.name, family)?,
        TableKind::Stats { tag_columns } => {
            let ck_range = stats_ck_range(query, tag_columns);
            QueryPlan {
                nodes: vec![ScanNode {
                    table: def.name.clone(),
                    partitions,
                    ck_range,
                    yields: ScanYield::Stats,
                }],
                family,
                needs_point_read: false,
            }
        }
        TableKind::ObjectValue => plan_object_value(query, &def.name, registry, family)?,
        TableKind::MessageIndex { .. } | TableKind::TimestampIndex | TableKind::System => {
            return Err(SandflowError::UnsupportedPredicate(format!(
                "table '{}' is not directly queryable",
                def.name
            )))
        }
    };

    Ok(plan)
}

/// Reject predicate shapes no index or evaluator can satisfy.
fn validate_predicates(query: &Query, kind: &TableKind) -> Result<()> {
    let all_predicates = query
        .where_clause
        .iter()
        .flatten()
        .chain(query.filter.iter());
    for p in all_predicates {
        match p.op {
            PredicateOp::Contains => {
                let keyword_indexed =
                    matches!(kind, TableKind::Message) && p.column == "Keyword";
                if !keyword_indexed {
                    return Err(SandflowError::UnsupportedPredicate(format!(
                        "CONTAINS on '{}' requires a keyword index",
                        p.column
                    )));
                }
            }
            PredicateOp::Ge | PredicateOp::Le => {
                if matches!(kind, TableKind::Message) {
                    return Err(SandflowError::UnsupportedPredicate(format!(
                        "range predicate on non-numeric column '{}'",
                        p.column
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Index choice for one AND group.
struct IndexChoice<'a> {
    table: String,
    column: IndexColumn,
    predicate: &'a Predicate,
}

fn plan_message(
    query: &Query,
    registry: &TableRegistry,
    partitions: Vec<String>,
    family: TableFamily,
) -> Result<QueryPlan> {
    let indexes = registry.message_indexes();
    let mut nodes: Vec<ScanNode> = Vec::new();

    let fallback = |partitions: &[String]| ScanNode {
        table: MESSAGE_TABLE_TIMESTAMP.to_string(),
        partitions: partitions.to_vec(),
        ck_range: CkRange::between(
            &fmt_ts(query.start_time_usec),
            &prefix_upper_bound(&fmt_ts(query.end_time_usec)),
        ),
        yields: ScanYield::IndexUuid,
    };

    if query.where_clause.is_empty() {
        nodes.push(fallback(&partitions));
        return Ok(QueryPlan {
            nodes,
            family,
            needs_point_read: true,
        });
    }

    for group in &query.where_clause {
        let mut best: Option<IndexChoice<'_>> = None;
        for predicate in group {
            let eligible = matches!(
                predicate.op,
                PredicateOp::Eq | PredicateOp::In | PredicateOp::LikePrefix | PredicateOp::Contains
            );
            if !eligible {
                continue;
            }
            let Some((table, column)) = indexes
                .iter()
                .find(|(_, c)| c.column_name() == predicate.column)
                .cloned()
            else {
                continue;
            };

            // Exact matches beat prefix scans, then the cardinality rank.
            let exactness = match predicate.op {
                PredicateOp::LikePrefix => 0u8,
                _ => 1,
            };
            let better = match &best {
                None => true,
                Some(current) => {
                    let current_exactness = match current.predicate.op {
                        PredicateOp::LikePrefix => 0u8,
                        _ => 1,
                    };
                    (exactness, index_rank(column))
                        > (current_exactness, index_rank(current.column))
                }
            };
            if better {
                best = Some(IndexChoice {
                    table,
                    column,
                    predicate,
                });
            }
        }

        match best {
            None => nodes.push(fallback(&partitions)),
            Some(choice) => {
                for ck_range in index_ck_ranges(choice.predicate)? {
                    nodes.push(ScanNode {
                        table: choice.table.clone(),
                        partitions: partitions.clone(),
                        ck_range,
                        yields: ScanYield::IndexUuid,
                    });
                }
            }
        }
    }

    Ok(QueryPlan {
        nodes,
        family,
        needs_point_read: true,
    })
}

/// Clustering ranges an indexed predicate narrows to. `In` expands to
/// one range per option.
fn index_ck_ranges(predicate: &Predicate) -> Result<Vec<CkRange>> {
    let exact = |value: &Value| -> Result<CkRange> {
        let text = value_text(value)?;
        Ok(CkRange::prefix(&format!("{}{}", text, KEY_SEP)))
    };

    match predicate.op {
        PredicateOp::Eq | PredicateOp::Contains => Ok(vec![exact(&predicate.value)?]),
        PredicateOp::In => match &predicate.value {
            Value::Array(options) => options.iter().map(exact).collect(),
            other => Err(SandflowError::UnsupportedPredicate(format!(
                "IN expects an array, got {}",
                other
            ))),
        },
        PredicateOp::LikePrefix => {
            let prefix = value_text(&predicate.value)?;
            Ok(vec![CkRange::between(
                &prefix,
                &prefix_upper_bound(&prefix),
            )])
        }
        _ => Err(SandflowError::UnsupportedPredicate(format!(
            "operator {:?} is not index-eligible",
            predicate.op
        ))),
    }
}

fn value_text(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(SandflowError::UnsupportedPredicate(format!(
            "index predicate value must be scalar, got {}",
            other
        ))),
    }
}

/// Flow record lookups require the flow uuid; the table is keyed by it.
fn plan_flow_record(query: &Query, table: &str, family: TableFamily) -> Result<QueryPlan> {
    let mut partitions = Vec::new();
    for group in &query.where_clause {
        let uuid = group
            .iter()
            .find(|p| p.column == "flow_uuid" && p.op == PredicateOp::Eq)
            .and_then(|p| p.value.as_str())
            .ok_or_else(|| {
                SandflowError::UnsupportedPredicate(
                    "flow record queries require flow_uuid = <uuid>".into(),
                )
            })?;
        partitions.push(uuid.to_string());
    }
    if partitions.is_empty() {
        return Err(SandflowError::UnsupportedPredicate(
            "flow record queries require a where clause".into(),
        ));
    }
    Ok(QueryPlan {
        nodes: vec![ScanNode {
            table: table.to_string(),
            partitions,
            ck_range: CkRange::all(),
            yields: ScanYield::FlowRecord,
        }],
        family,
        needs_point_read: false,
    })
}

/// Leading-tag Eq predicates of a single-group where clause narrow the
/// clustering range; everything else is evaluated post-read.
fn stats_ck_range(query: &Query, tag_columns: &[String]) -> CkRange {
    if query.where_clause.len() != 1 {
        return CkRange::all();
    }
    let group = &query.where_clause[0];

    let mut prefix_parts: Vec<String> = Vec::new();
    for tag in tag_columns {
        let Some(value) = group
            .iter()
            .find(|p| &p.column == tag && p.op == PredicateOp::Eq)
            .and_then(|p| p.value.as_str())
        else {
            break;
        };
        prefix_parts.push(value.to_string());
    }
    if prefix_parts.is_empty() {
        return CkRange::all();
    }
    let parts: Vec<&str> = prefix_parts.iter().map(String::as_str).collect();
    CkRange::prefix(&format!("{}{}", encode_parts(&parts), KEY_SEP))
}

/// Object tables need the object type to form partition keys.
fn plan_object_value(
    query: &Query,
    table: &str,
    registry: &TableRegistry,
    family: TableFamily,
) -> Result<QueryPlan> {
    let bits = registry.partition_bits();
    let mut nodes = Vec::new();

    if query.where_clause.is_empty() {
        return Err(SandflowError::UnsupportedPredicate(
            "object queries require ObjectType = <type>".into(),
        ));
    }

    for group in &query.where_clause {
        let object_type = group
            .iter()
            .find(|p| p.column == "ObjectType" && p.op == PredicateOp::Eq)
            .and_then(|p| p.value.as_str())
            .ok_or_else(|| {
                SandflowError::UnsupportedPredicate(
                    "object queries require ObjectType = <type>".into(),
                )
            })?;

        let partitions: Vec<String> =
            partition_range(query.start_time_usec, query.end_time_usec, bits)
                .map(|t| encode_parts(&[&fmt_t(t), object_type]))
                .collect();
        nodes.push(ScanNode {
            table: table.to_string(),
            partitions,
            ck_range: CkRange::between(
                &fmt_ts(query.start_time_usec),
                &prefix_upper_bound(&fmt_ts(query.end_time_usec)),
            ),
            yields: ScanYield::ObjectValue,
        });
    }

    Ok(QueryPlan {
        nodes,
        family,
        needs_point_read: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SelectField;
    use sandflow_core::RetentionConfig;
    use sandflow_store::{
        MemBackend, Store, MESSAGE_TABLE, MESSAGE_TABLE_MODULE_ID, OBJECT_TABLE,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (Arc<TableRegistry>, Arc<SystemState>) {
        let registry = Arc::new(TableRegistry::standard(23));
        let store = Arc::new(Store::new(Arc::new(MemBackend::new())));
        registry.ensure_tables(&store).unwrap();
        let system =
            Arc::new(SystemState::load(store, RetentionConfig::default(), 1).unwrap());
        (registry, system)
    }

    fn base_query(table: &str) -> Query {
        Query {
            table: table.to_string(),
            start_time_usec: 10 << 23,
            end_time_usec: 12 << 23,
            select: vec![SelectField::Column("uuid".into())],
            where_clause: vec![],
            filter: vec![],
            sort: vec![],
            limit: None,
            offset: None,
        }
    }

    #[test]
    fn test_no_where_uses_timestamp_index() {
        let (registry, system) = setup();
        let plan = plan(&base_query(MESSAGE_TABLE), &registry, &system).unwrap();
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].table, MESSAGE_TABLE_TIMESTAMP);
        assert_eq!(plan.nodes[0].partitions.len(), 3);
        assert!(plan.needs_point_read);
    }

    #[test]
    fn test_eq_predicate_picks_matching_index() {
        let (registry, system) = setup();
        let mut query = base_query(MESSAGE_TABLE);
        query.where_clause = vec![vec![Predicate::eq("ModuleId", json!("Collector"))]];
        let plan = plan(&query, &registry, &system).unwrap();
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].table, MESSAGE_TABLE_MODULE_ID);
    }

    #[test]
    fn test_higher_cardinality_index_wins() {
        let (registry, system) = setup();
        let mut query = base_query(MESSAGE_TABLE);
        query.where_clause = vec![vec![
            Predicate::eq("Source", json!("h1")),
            Predicate::eq("ObjectId", json!("VirtualNetwork:vn1")),
        ]];
        let plan = plan(&query, &registry, &system).unwrap();
        assert_eq!(plan.nodes[0].table, OBJECT_TABLE);
    }

    #[test]
    fn test_exact_beats_prefix() {
        let (registry, system) = setup();
        let mut query = base_query(MESSAGE_TABLE);
        query.where_clause = vec![vec![
            Predicate {
                column: "ObjectId".into(),
                op: PredicateOp::LikePrefix,
                value: json!("VirtualNetwork:"),
            },
            Predicate::eq("Source", json!("h1")),
        ]];
        let plan = plan(&query, &registry, &system).unwrap();
        // Source has lower cardinality but Eq beats LikePrefix.
        assert_eq!(plan.nodes[0].table, sandflow_store::MESSAGE_TABLE_SOURCE);
    }

    #[test]
    fn test_or_groups_emit_one_node_each() {
        let (registry, system) = setup();
        let mut query = base_query(MESSAGE_TABLE);
        query.where_clause = vec![
            vec![Predicate::eq("ModuleId", json!("Collector"))],
            vec![Predicate::eq("Source", json!("h1"))],
        ];
        let plan = plan(&query, &registry, &system).unwrap();
        assert_eq!(plan.nodes.len(), 2);
    }

    #[test]
    fn test_in_expands_to_multiple_ranges() {
        let (registry, system) = setup();
        let mut query = base_query(MESSAGE_TABLE);
        query.where_clause = vec![vec![Predicate {
            column: "ModuleId".into(),
            op: PredicateOp::In,
            value: json!(["Collector", "Agent"]),
        }]];
        let plan = plan(&query, &registry, &system).unwrap();
        assert_eq!(plan.nodes.len(), 2);
    }

    #[test]
    fn test_contains_requires_keyword_index() {
        let (registry, system) = setup();
        let mut query = base_query(MESSAGE_TABLE);
        query.where_clause = vec![vec![Predicate {
            column: "Keyword".into(),
            op: PredicateOp::Contains,
            value: json!("restart"),
        }]];
        assert!(plan(&query, &registry, &system).is_ok());

        query.where_clause = vec![vec![Predicate {
            column: "Source".into(),
            op: PredicateOp::Contains,
            value: json!("h"),
        }]];
        assert!(matches!(
            plan(&query, &registry, &system),
            Err(SandflowError::UnsupportedPredicate(_))
        ));
    }

    #[test]
    fn test_below_retention_rejected() {
        let (registry, system) = setup();
        system
            .advance_epoch(TableFamily::Global, 11 << 23)
            .unwrap();
        let query = base_query(MESSAGE_TABLE);
        assert!(matches!(
            plan(&query, &registry, &system),
            Err(SandflowError::BelowRetention { .. })
        ));
    }

    #[test]
    fn test_object_query_requires_type() {
        let (registry, system) = setup();
        let mut query = base_query(sandflow_store::OBJECT_VALUE_TABLE);
        assert!(plan(&query, &registry, &system).is_err());

        query.where_clause = vec![vec![Predicate::eq("ObjectType", json!("VirtualNetwork"))]];
        let plan = plan(&query, &registry, &system).unwrap();
        assert_eq!(plan.nodes.len(), 1);
        assert!(plan.nodes[0].partitions[0].contains("VirtualNetwork"));
    }

    #[test]
    fn test_ge_on_message_table_rejected() {
        let (registry, system) = setup();
        let mut query = base_query(MESSAGE_TABLE);
        query.where_clause = vec![vec![Predicate {
            column: "Source".into(),
            op: PredicateOp::Ge,
            value: json!(5),
        }]];
        assert!(matches!(
            plan(&query, &registry, &system),
            Err(SandflowError::UnsupportedPredicate(_))
        ));
    }
}
