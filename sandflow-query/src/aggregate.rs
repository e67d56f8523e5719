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

//! Aggregation and time binning.
//!
//! Rows group by the time bucket (`floor(T / g)`, right-open) plus every
//! plain column in the select list; aggregate fields accumulate per
//! group. Integer-valued results are emitted as integers so `sum(bytes)`
//! stays a count, not a float.

use crate::model::{AggFunc, SelectField, ResultRow};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Default)]
struct Accum {
    sum: f64,
    count: u64,
    min: Option<f64>,
    max: Option<f64>,
    distinct: HashSet<String>,
}

impl Accum {
    fn add(&mut self, value: Option<&Value>) {
        let Some(value) = value else { return };
        self.count += 1;
        if let Some(n) = value.as_f64() {
            self.sum += n;
            self.min = Some(self.min.map_or(n, |m| m.min(n)));
            self.max = Some(self.max.map_or(n, |m| m.max(n)));
        }
        self.distinct.insert(canonical(value));
    }

    fn finish(&self, func: AggFunc) -> Value {
        match func {
            AggFunc::Sum => number(self.sum),
            AggFunc::Count => Value::from(self.count),
            AggFunc::Min => self.min.map(number).unwrap_or(Value::Null),
            AggFunc::Max => self.max.map(number).unwrap_or(Value::Null),
            AggFunc::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    number(self.sum / self.count as f64)
                }
            }
            AggFunc::CountDistinct => Value::from(self.distinct.len() as u64),
        }
    }
}

/// Integer-valued floats render as integers.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (1u64 << 53) as f64 {
        if n >= 0.0 {
            Value::from(n as u64)
        } else {
            Value::from(n as i64)
        }
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Stable text form for COUNT_DISTINCT membership.
fn canonical(value: &Value) -> String {
    value.to_string()
}

/// Grouped accumulation over the select list.
pub struct Aggregation {
    bin_usec: Option<u64>,
    group_columns: Vec<String>,
    aggregates: Vec<(AggFunc, String)>,
}

impl Aggregation {
    /// None when the select list has no aggregate and no time bin.
    pub fn from_select(select: &[SelectField]) -> Option<Self> {
        let mut bin_usec = None;
        let mut group_columns = Vec::new();
        let mut aggregates = Vec::new();
        for field in select {
            match field {
                SelectField::Column(name) => group_columns.push(name.clone()),
                SelectField::TimeBin { granularity_usec } => bin_usec = Some(*granularity_usec),
                SelectField::Aggregate { func, column } => {
                    aggregates.push((*func, column.clone()))
                }
            }
        }
        if bin_usec.is_none() && aggregates.is_empty() {
            return None;
        }
        Some(Self {
            bin_usec,
            group_columns,
            aggregates,
        })
    }

    /// Run the grouping over all records.
    pub fn run<'a, I, L>(&self, records: I) -> Vec<ResultRow>
    where
        I: IntoIterator<Item = L>,
        L: Fn(&str) -> Option<Value>,
    {
        // Group key -> (group values, accumulators). BTreeMap keeps the
        // output deterministic.
        let mut groups: BTreeMap<String, (ResultRow, Vec<Accum>)> = BTreeMap::new();

        for lookup in records {
            let mut key = String::new();
            let mut row = ResultRow::new();

            if let Some(g) = self.bin_usec {
                let t = lookup("T").and_then(|v| v.as_u64()).unwrap_or(0);
                let bucket = (t / g) * g;
                key.push_str(&format!("{:020}|", bucket));
                row.insert("T".to_string(), Value::from(bucket));
            }
            for column in &self.group_columns {
                let value = lookup(column).unwrap_or(Value::Null);
                key.push_str(&canonical(&value));
                key.push('|');
                row.insert(column.clone(), value);
            }

            let entry = groups.entry(key).or_insert_with(|| {
                (row, self.aggregates.iter().map(|_| Accum::default()).collect())
            });
            for ((_, column), accum) in self.aggregates.iter().zip(entry.1.iter_mut()) {
                accum.add(lookup(column).as_ref());
            }
        }

        groups
            .into_values()
            .map(|(mut row, accums)| {
                for ((func, column), accum) in self.aggregates.iter().zip(accums.iter()) {
                    row.insert(format!("{}({})", agg_name(*func), column), accum.finish(*func));
                }
                row
            })
            .collect()
    }
}

fn agg_name(func: AggFunc) -> &'static str {
    match func {
        AggFunc::Sum => "sum",
        AggFunc::Count => "count",
        AggFunc::Min => "min",
        AggFunc::Max => "max",
        AggFunc::Avg => "avg",
        AggFunc::CountDistinct => "count_distinct",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(t: u64, sport: u16, bytes: u64) -> impl Fn(&str) -> Option<Value> {
        move |name: &str| match name {
            "T" => Some(json!(t)),
            "sport" => Some(json!(sport)),
            "bytes" => Some(json!(bytes)),
            _ => None,
        }
    }

    #[test]
    fn test_plain_select_is_not_aggregation() {
        assert!(Aggregation::from_select(&[SelectField::Column("uuid".into())]).is_none());
    }

    #[test]
    fn test_group_by_column_with_sum() {
        // S2 shape: select [sport, sum(bytes)].
        let agg = Aggregation::from_select(&[
            SelectField::Column("sport".into()),
            SelectField::Aggregate {
                func: AggFunc::Sum,
                column: "bytes".into(),
            },
        ])
        .unwrap();

        let rows = agg.run(vec![
            record(1, 10, 100),
            record(2, 11, 400),
            record(3, 10, 50),
        ]);
        assert_eq!(rows.len(), 2);
        let by_sport: BTreeMap<u64, &ResultRow> = rows
            .iter()
            .map(|r| (r["sport"].as_u64().unwrap(), r))
            .collect();
        assert_eq!(by_sport[&10]["sum(bytes)"], json!(150));
        assert_eq!(by_sport[&11]["sum(bytes)"], json!(400));
    }

    #[test]
    fn test_time_binning_right_open() {
        // S3 shape: 8 samples 1s apart, T=4000000 buckets of 4.
        let agg = Aggregation::from_select(&[
            SelectField::TimeBin {
                granularity_usec: 4_000_000,
            },
            SelectField::Aggregate {
                func: AggFunc::Sum,
                column: "bytes".into(),
            },
        ])
        .unwrap();

        let base = 1_600_000_000_000_000u64 - (1_600_000_000_000_000u64 % 4_000_000);
        let rows = agg.run((0..8).map(|i| record(base + i * 1_000_000, 10, 100)));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["sum(bytes)"], json!(400));
        assert_eq!(rows[1]["sum(bytes)"], json!(400));
        assert_eq!(
            rows[1]["T"].as_u64().unwrap() - rows[0]["T"].as_u64().unwrap(),
            4_000_000
        );
    }

    #[test]
    fn test_avg_min_max_count() {
        let agg = Aggregation::from_select(&[
            SelectField::Aggregate {
                func: AggFunc::Avg,
                column: "bytes".into(),
            },
            SelectField::Aggregate {
                func: AggFunc::Min,
                column: "bytes".into(),
            },
            SelectField::Aggregate {
                func: AggFunc::Max,
                column: "bytes".into(),
            },
            SelectField::Aggregate {
                func: AggFunc::Count,
                column: "bytes".into(),
            },
        ])
        .unwrap();

        let rows = agg.run(vec![record(1, 1, 100), record(2, 1, 200), record(3, 1, 600)]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["avg(bytes)"], json!(300));
        assert_eq!(rows[0]["min(bytes)"], json!(100));
        assert_eq!(rows[0]["max(bytes)"], json!(600));
        assert_eq!(rows[0]["count(bytes)"], json!(3));
    }

    #[test]
    fn test_count_distinct() {
        let agg = Aggregation::from_select(&[SelectField::Aggregate {
            func: AggFunc::CountDistinct,
            column: "sport".into(),
        }])
        .unwrap();
        let rows = agg.run(vec![record(1, 10, 1), record(2, 10, 2), record(3, 11, 3)]);
        assert_eq!(rows[0]["count_distinct(sport)"], json!(2));
    }
}
