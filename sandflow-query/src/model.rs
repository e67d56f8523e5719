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

//! Query model.
//!
//! The select list mixes plain columns, a time-binning pseudo-column
//! (`"T=<granularity_usec>"`), and aggregate calls (`"sum(bytes)"`); all
//! three serialize as strings to keep the JSON surface flat. The where
//! clause is DNF: an OR of AND groups.

use sandflow_core::{Severity, TelemetryMessage};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// One result row, column name to value.
pub type ResultRow = BTreeMap<String, Value>;

/// Aggregate functions accepted in the select list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggFunc {
    Sum,
    Count,
    Min,
    Max,
    Avg,
    CountDistinct,
}

impl AggFunc {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Some(AggFunc::Sum),
            "count" => Some(AggFunc::Count),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            "avg" => Some(AggFunc::Avg),
            "count_distinct" => Some(AggFunc::CountDistinct),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Count => "count",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Avg => "avg",
            AggFunc::CountDistinct => "count_distinct",
        }
    }
}

/// One entry of the select list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectField {
    Column(String),
    /// `T=<granularity_usec>`: right-open time buckets.
    TimeBin { granularity_usec: u64 },
    Aggregate { func: AggFunc, column: String },
}

impl SelectField {
    /// Column name this field produces in result rows.
    pub fn output_name(&self) -> String {
        match self {
            SelectField::Column(name) => name.clone(),
            SelectField::TimeBin { .. } => "T".to_string(),
            SelectField::Aggregate { func, column } => format!("{}({})", func.name(), column),
        }
    }

    fn parse(text: &str) -> Result<Self, String> {
        if let Some(granularity) = text.strip_prefix("T=") {
            let granularity_usec: u64 = granularity
                .parse()
                .map_err(|_| format!("bad time-bin granularity '{}'", granularity))?;
            if granularity_usec == 0 {
                return Err("time-bin granularity must be positive".to_string());
            }
            return Ok(SelectField::TimeBin { granularity_usec });
        }
        if let Some(open) = text.find('(') {
            if let Some(inner) = text[open + 1..].strip_suffix(')') {
                let func = AggFunc::parse(&text[..open])
                    .ok_or_else(|| format!("unknown aggregate '{}'", &text[..open]))?;
                return Ok(SelectField::Aggregate {
                    func,
                    column: inner.to_string(),
                });
            }
        }
        Ok(SelectField::Column(text.to_string()))
    }
}

impl fmt::Display for SelectField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectField::TimeBin { granularity_usec } => write!(f, "T={}", granularity_usec),
            other => write!(f, "{}", other.output_name()),
        }
    }
}

impl Serialize for SelectField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SelectField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        SelectField::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Predicate operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    Ne,
    In,
    /// `LIKE prefix*`; the value is the prefix without the star.
    LikePrefix,
    Ge,
    Le,
    /// Keyword containment; requires a keyword index.
    Contains,
}

/// One predicate. `In` carries its list in `value` as a JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: PredicateOp,
    pub value: Value,
}

impl Predicate {
    pub fn eq(column: &str, value: Value) -> Self {
        Self {
            column: column.to_string(),
            op: PredicateOp::Eq,
            value,
        }
    }

    /// Evaluate against a record's column accessor.
    pub fn matches(&self, lookup: &dyn Fn(&str) -> Option<Value>) -> bool {
        let actual = lookup(&self.column);
        match self.op {
            PredicateOp::Eq => actual.map_or(false, |v| values_equal(&v, &self.value)),
            PredicateOp::Ne => actual.map_or(true, |v| !values_equal(&v, &self.value)),
            PredicateOp::In => match (&actual, &self.value) {
                (Some(v), Value::Array(options)) => {
                    options.iter().any(|option| values_equal(v, option))
                }
                _ => false,
            },
            PredicateOp::LikePrefix => match (&actual, &self.value) {
                (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            PredicateOp::Ge => compare_numeric(&actual, &self.value).map_or(false, |o| o >= 0.0),
            PredicateOp::Le => compare_numeric(&actual, &self.value).map_or(false, |o| o <= 0.0),
            PredicateOp::Contains => match (&actual, &self.value) {
                (Some(Value::Array(items)), needle) => {
                    items.iter().any(|item| values_equal(item, needle))
                }
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                _ => false,
            },
        }
    }
}

/// Numeric comparisons coerce to f64; everything else compares exactly.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_numeric(actual: &Option<Value>, expected: &Value) -> Option<f64> {
    let a = actual.as_ref()?.as_f64()?;
    let b = expected.as_f64()?;
    Some(a - b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
    pub column: String,
    #[serde(default)]
    pub order: SortOrder,
}

/// The structured query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub table: String,
    pub start_time_usec: u64,
    pub end_time_usec: u64,
    pub select: Vec<SelectField>,
    /// DNF: OR of AND groups. Empty matches everything.
    #[serde(default, rename = "where")]
    pub where_clause: Vec<Vec<Predicate>>,
    /// Applied post-read, AND semantics.
    #[serde(default)]
    pub filter: Vec<Predicate>,
    #[serde(default)]
    pub sort: Vec<SortField>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl Query {
    pub fn has_aggregation(&self) -> bool {
        self.select.iter().any(|f| {
            matches!(
                f,
                SelectField::Aggregate { .. } | SelectField::TimeBin { .. }
            )
        })
    }

    /// Evaluate the DNF where clause against one record.
    pub fn where_matches(&self, lookup: &dyn Fn(&str) -> Option<Value>) -> bool {
        if self.where_clause.is_empty() {
            return true;
        }
        self.where_clause
            .iter()
            .any(|group| group.iter().all(|p| p.matches(lookup)))
    }

    pub fn filter_matches(&self, lookup: &dyn Fn(&str) -> Option<Value>) -> bool {
        self.filter.iter().all(|p| p.matches(lookup))
    }
}

/// Execution counters attached to every response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryExecStats {
    pub rows_scanned: u64,
    pub partitions_scanned: u64,
    pub duration_ms: u64,
}

/// Status envelope: `partial` is set when a deadline or a degraded cache
/// truncated the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryStatus {
    pub ok: bool,
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub stats: QueryExecStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub status: QueryStatus,
    pub rows: Vec<ResultRow>,
}

/// Query-visible columns of a telemetry message.
pub fn message_column(msg: &TelemetryMessage, name: &str) -> Option<Value> {
    use serde_json::json;
    match name {
        "uuid" => Some(json!(msg.uuid.to_string())),
        "T" => Some(json!(msg.timestamp_usec)),
        "Source" => Some(json!(msg.source)),
        "ModuleId" => Some(json!(msg.module)),
        "InstanceId" => Some(json!(msg.instance_id)),
        "NodeType" => Some(json!(msg.node_type)),
        "Category" => Some(json!(msg.category)),
        "Messagetype" => Some(json!(msg.message_type)),
        "Level" => Some(json!(msg.severity as u8)),
        "SequenceNum" => Some(json!(msg.sequence_num)),
        "Keyword" => Some(json!(msg
            .keywords
            .iter()
            .cloned()
            .collect::<Vec<String>>())),
        "ObjectId" => Some(json!(msg
            .object_refs
            .iter()
            .map(|r| format!("{}:{}", r.object_type, r.object_id))
            .collect::<Vec<String>>())),
        "Data" => Some(msg.payload.clone()),
        _ => None,
    }
}

/// Severity helper for filters like `Level <= 4`.
pub fn severity_value(severity: Severity) -> Value {
    Value::from(severity as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_select_field_parsing() {
        let fields: Vec<SelectField> =
            serde_json::from_value(json!(["uuid", "T=4000000", "sum(bytes)", "count_distinct(Source)"]))
                .unwrap();
        assert_eq!(fields[0], SelectField::Column("uuid".into()));
        assert_eq!(
            fields[1],
            SelectField::TimeBin {
                granularity_usec: 4_000_000
            }
        );
        assert_eq!(
            fields[2],
            SelectField::Aggregate {
                func: AggFunc::Sum,
                column: "bytes".into()
            }
        );
        assert_eq!(
            fields[3],
            SelectField::Aggregate {
                func: AggFunc::CountDistinct,
                column: "Source".into()
            }
        );
    }

    #[test]
    fn test_select_field_round_trip() {
        let field = SelectField::Aggregate {
            func: AggFunc::Sum,
            column: "bytes".into(),
        };
        let text = serde_json::to_string(&field).unwrap();
        assert_eq!(text, "\"sum(bytes)\"");
        let back: SelectField = serde_json::from_str(&text).unwrap();
        assert_eq!(back, field);
    }

    #[test]
    fn test_bad_granularity_rejected() {
        assert!(serde_json::from_value::<SelectField>(json!("T=0")).is_err());
        assert!(serde_json::from_value::<SelectField>(json!("T=abc")).is_err());
    }

    #[test]
    fn test_predicate_eval() {
        let lookup = |name: &str| -> Option<Value> {
            match name {
                "ModuleId" => Some(json!("Collector")),
                "sport" => Some(json!(10)),
                "Keyword" => Some(json!(["restart", "error"])),
                _ => None,
            }
        };

        assert!(Predicate::eq("ModuleId", json!("Collector")).matches(&lookup));
        assert!(!Predicate::eq("ModuleId", json!("Agent")).matches(&lookup));
        assert!(Predicate {
            column: "sport".into(),
            op: PredicateOp::Ge,
            value: json!(10)
        }
        .matches(&lookup));
        assert!(Predicate {
            column: "ModuleId".into(),
            op: PredicateOp::LikePrefix,
            value: json!("Coll")
        }
        .matches(&lookup));
        assert!(Predicate {
            column: "Keyword".into(),
            op: PredicateOp::Contains,
            value: json!("restart")
        }
        .matches(&lookup));
        assert!(Predicate {
            column: "sport".into(),
            op: PredicateOp::In,
            value: json!([9, 10, 11])
        }
        .matches(&lookup));
        // Ne on a missing column matches.
        assert!(Predicate {
            column: "absent".into(),
            op: PredicateOp::Ne,
            value: json!(1)
        }
        .matches(&lookup));
    }

    #[test]
    fn test_dnf_evaluation() {
        let query = Query {
            table: "MessageTable".into(),
            start_time_usec: 0,
            end_time_usec: 10,
            select: vec![SelectField::Column("uuid".into())],
            where_clause: vec![
                vec![Predicate::eq("a", json!(1)), Predicate::eq("b", json!(2))],
                vec![Predicate::eq("c", json!(3))],
            ],
            filter: vec![],
            sort: vec![],
            limit: None,
            offset: None,
        };

        let both = |name: &str| -> Option<Value> {
            match name {
                "a" => Some(json!(1)),
                "b" => Some(json!(2)),
                _ => None,
            }
        };
        let only_c = |name: &str| -> Option<Value> {
            (name == "c").then(|| json!(3))
        };
        let neither = |_: &str| -> Option<Value> { None };

        assert!(query.where_matches(&both));
        assert!(query.where_matches(&only_c));
        assert!(!query.where_matches(&neither));
    }

    #[test]
    fn test_query_json_shape() {
        let query: Query = serde_json::from_value(json!({
            "table": "MessageTable",
            "start_time_usec": 0,
            "end_time_usec": 1000,
            "select": ["uuid"],
            "where": [[{"column": "ModuleId", "op": "eq", "value": "Collector"}]],
            "sort": [{"column": "T", "order": "desc"}],
            "limit": 10
        }))
        .unwrap();
        assert_eq!(query.where_clause.len(), 1);
        assert_eq!(query.sort[0].order, SortOrder::Desc);
        assert_eq!(query.limit, Some(10));
    }
}
