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

//! Query execution.
//!
//! Every partition scan runs in its own task under a shared semaphore;
//! results stream through a bounded channel. The wall-clock deadline
//! cuts the collection phase: whatever arrived is post-processed and
//! returned with `partial = true`. Post-read, the full DNF where clause
//! is re-evaluated against every decoded record, so index pruning can
//! only narrow candidates, never change the answer.

use crate::aggregate::Aggregation;
use crate::model::{
    message_column, Query, QueryExecStats, QueryResult, QueryStatus, ResultRow, SelectField,
    SortField, SortOrder,
};
use crate::planner::{self, QueryPlan, ScanNode, ScanYield};
use sandflow_core::{FlowSample, QueryConfig, Result, StatSample, TelemetryMessage};
use sandflow_store::{decode_parts, CkRange, Store, SystemState, TableRegistry, MESSAGE_TABLE};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

/// One decoded record, uniform for predicate evaluation and selection.
enum Record {
    Message(Box<TelemetryMessage>),
    Flow(FlowSample),
    Stat(StatSample),
    Object { object_id: String, timestamp_usec: u64 },
}

impl Record {
    fn timestamp_usec(&self) -> u64 {
        match self {
            Record::Message(m) => m.timestamp_usec,
            Record::Flow(f) => f.timestamp_usec,
            Record::Stat(s) => s.timestamp_usec,
            Record::Object { timestamp_usec, .. } => *timestamp_usec,
        }
    }

    fn column(&self, name: &str) -> Option<Value> {
        match self {
            Record::Message(m) => message_column(m, name),
            Record::Flow(f) => f.column(name),
            Record::Stat(s) => match name {
                "T" => Some(Value::from(s.timestamp_usec)),
                _ => s
                    .tags
                    .get(name)
                    .map(|v| Value::from(v.clone()))
                    .or_else(|| s.values.get(name).and_then(|v| v.as_f64()).map(Value::from)),
            },
            Record::Object {
                object_id,
                timestamp_usec,
            } => match name {
                "ObjectId" => Some(Value::from(object_id.clone())),
                "T" => Some(Value::from(*timestamp_usec)),
                _ => None,
            },
        }
    }
}

/// Candidate streamed out of a scan task.
enum ScanItem {
    /// (uuid, timestamp) pair decoded off an index row.
    Uuid { uuid: String, timestamp_usec: u64 },
    Record(Record),
}

pub struct QueryEngine {
    store: Arc<Store>,
    registry: Arc<TableRegistry>,
    system: Arc<SystemState>,
    config: QueryConfig,
    scans: Arc<Semaphore>,
}

impl QueryEngine {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<TableRegistry>,
        system: Arc<SystemState>,
        config: QueryConfig,
    ) -> Self {
        let scans = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store,
            registry,
            system,
            config,
            scans,
        }
    }

    /// Plan and run one query to a complete response envelope.
    pub async fn execute(&self, query: Query) -> Result<QueryResult> {
        let started = Instant::now();
        let plan = planner::plan(&query, &self.registry, &self.system)?;
        let deadline = Duration::from_millis(self.config.default_deadline_ms.max(1));

        let rows_scanned = Arc::new(AtomicU64::new(0));
        let partitions_scanned = Arc::new(AtomicU64::new(0));
        let (items, partial) = self
            .collect_items(&plan, started + deadline, &rows_scanned, &partitions_scanned)
            .await;

        let records = self.resolve(&query, &plan, items)?;
        let mut rows = self.select(&query, records);
        sort_rows(&mut rows, &query);
        let rows = page(rows, &query);

        Ok(QueryResult {
            status: QueryStatus {
                ok: true,
                partial,
                reason: partial.then(|| "deadline exceeded".to_string()),
                stats: QueryExecStats {
                    rows_scanned: rows_scanned.load(AtomicOrdering::Relaxed),
                    partitions_scanned: partitions_scanned.load(AtomicOrdering::Relaxed),
                    duration_ms: started.elapsed().as_millis() as u64,
                },
            },
            rows,
        })
    }

    /// Fan scans out and drain the bounded channel until done or the
    /// deadline. Returns (items, hit_deadline).
    async fn collect_items(
        &self,
        plan: &QueryPlan,
        deadline: Instant,
        rows_scanned: &Arc<AtomicU64>,
        partitions_scanned: &Arc<AtomicU64>,
    ) -> (Vec<ScanItem>, bool) {
        let (tx, mut rx) = mpsc::channel::<Result<ScanItem>>(1024);

        for node in plan.nodes.clone() {
            let tx = tx.clone();
            let store = self.store.clone();
            let scans = self.scans.clone();
            let rows_scanned = rows_scanned.clone();
            let partitions_scanned = partitions_scanned.clone();
            tokio::spawn(async move {
                let _permit = match scans.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };
                scan_node(&store, &node, &tx, &rows_scanned, &partitions_scanned).await;
            });
        }
        drop(tx);

        let mut items = Vec::new();
        let mut partial = false;
        loop {
            match tokio::time::timeout_at(deadline.into(), rx.recv()).await {
                Ok(Some(Ok(item))) => items.push(item),
                Ok(Some(Err(e))) => {
                    // A failing partition scan degrades to a partial result.
                    debug!(error = %e, "scan failed, result will be partial");
                    partial = true;
                }
                Ok(None) => break,
                Err(_) => {
                    partial = true;
                    break;
                }
            }
        }
        (items, partial)
    }

    /// Index candidates become messages via point reads; everything else
    /// is already a record. Applies time bounds, the full where clause,
    /// and the post-read filter.
    fn resolve(&self, query: &Query, plan: &QueryPlan, items: Vec<ScanItem>) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        let mut seen_uuids: HashSet<String> = HashSet::new();

        for item in items {
            match item {
                ScanItem::Uuid {
                    uuid,
                    timestamp_usec,
                } => {
                    if timestamp_usec < query.start_time_usec
                        || timestamp_usec > query.end_time_usec
                    {
                        continue;
                    }
                    if !seen_uuids.insert(uuid.clone()) {
                        continue;
                    }
                    debug_assert!(plan.needs_point_read);
                    let rows =
                        self.store
                            .get_all(MESSAGE_TABLE, &uuid, &CkRange::all(), Some(1))?;
                    let Some(row) = rows.first() else {
                        // Index row outlived its message; skip.
                        continue;
                    };
                    let msg: TelemetryMessage = serde_json::from_slice(&row.value)?;
                    records.push(Record::Message(Box::new(msg)));
                }
                ScanItem::Record(record) => {
                    let ts = record.timestamp_usec();
                    if ts < query.start_time_usec || ts > query.end_time_usec {
                        continue;
                    }
                    records.push(record);
                }
            }
        }

        records.retain(|record| {
            let lookup = |name: &str| record.column(name);
            query.where_matches(&lookup) && query.filter_matches(&lookup)
        });
        Ok(records)
    }

    /// Project or aggregate the surviving records.
    fn select(&self, query: &Query, records: Vec<Record>) -> Vec<ResultRow> {
        if let Some(aggregation) = Aggregation::from_select(&query.select) {
            let lookups: Vec<_> = records
                .into_iter()
                .map(|record| move |name: &str| record.column(name))
                .collect();
            return aggregation.run(lookups);
        }

        let mut records = records;
        // Plain selects come back in timestamp order unless sorted
        // explicitly.
        records.sort_by_key(|r| r.timestamp_usec());
        records
            .into_iter()
            .map(|record| {
                let mut row = ResultRow::new();
                for field in &query.select {
                    if let SelectField::Column(name) = field {
                        row.insert(
                            name.clone(),
                            record.column(name).unwrap_or(Value::Null),
                        );
                    }
                }
                row
            })
            .collect()
    }
}

/// Run one scan node to completion, streaming decoded items.
async fn scan_node(
    store: &Store,
    node: &ScanNode,
    tx: &mpsc::Sender<Result<ScanItem>>,
    rows_scanned: &AtomicU64,
    partitions_scanned: &AtomicU64,
) {
    for partition in &node.partitions {
        partitions_scanned.fetch_add(1, AtomicOrdering::Relaxed);
        let rows = match store.get_all(&node.table, partition, &node.ck_range, None) {
            Ok(rows) => rows,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        for row in rows {
            rows_scanned.fetch_add(1, AtomicOrdering::Relaxed);
            let item = decode_row(node, partition, &row);
            match item {
                Some(item) => {
                    if tx.send(Ok(item)).await.is_err() {
                        // Receiver gone: deadline or caller cancelled.
                        return;
                    }
                }
                None => continue,
            }
        }
        // Yield between partitions so long scans stay cooperative.
        tokio::task::yield_now().await;
    }
}

fn decode_row(node: &ScanNode, _partition: &str, row: &sandflow_store::Row) -> Option<ScanItem> {
    match node.yields {
        ScanYield::IndexUuid => {
            let parts = decode_parts(&row.clustering);
            // (value, ts, uuid) on value indexes, (ts, uuid) on the
            // timestamp index.
            let (ts, uuid) = match parts.len() {
                2 => (parts[0], parts[1]),
                3 => (parts[1], parts[2]),
                _ => return None,
            };
            Some(ScanItem::Uuid {
                uuid: uuid.to_string(),
                timestamp_usec: ts.parse().ok()?,
            })
        }
        ScanYield::FlowSeries | ScanYield::FlowRecord => {
            let sample: FlowSample = serde_json::from_slice(&row.value).ok()?;
            Some(ScanItem::Record(Record::Flow(sample)))
        }
        ScanYield::Stats => {
            let sample: StatSample = serde_json::from_slice(&row.value).ok()?;
            Some(ScanItem::Record(Record::Stat(sample)))
        }
        ScanYield::ObjectValue => {
            let parts = decode_parts(&row.clustering);
            if parts.len() != 2 {
                return None;
            }
            Some(ScanItem::Record(Record::Object {
                object_id: String::from_utf8_lossy(&row.value).to_string(),
                timestamp_usec: parts[0].parse().ok()?,
            }))
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn compare_rows(a: &ResultRow, b: &ResultRow, sort: &[SortField]) -> Ordering {
    for field in sort {
        let av = a.get(&field.column).unwrap_or(&Value::Null);
        let bv = b.get(&field.column).unwrap_or(&Value::Null);
        let ordering = compare_values(av, bv);
        let ordering = match field.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Sort with a bounded top-K heap when a limit caps the output; full
/// sort otherwise.
fn sort_rows(rows: &mut Vec<ResultRow>, query: &Query) {
    if query.sort.is_empty() {
        return;
    }

    let keep = query
        .limit
        .map(|l| l + query.offset.unwrap_or(0))
        .filter(|k| *k < rows.len());

    match keep {
        None => rows.sort_by(|a, b| compare_rows(a, b, &query.sort)),
        Some(k) => {
            // Max-heap ordered worst-first: the root is the row that
            // leaves first.
            struct HeapRow<'q> {
                row: ResultRow,
                sort: &'q [SortField],
            }
            impl PartialEq for HeapRow<'_> {
                fn eq(&self, other: &Self) -> bool {
                    compare_rows(&self.row, &other.row, self.sort) == Ordering::Equal
                }
            }
            impl Eq for HeapRow<'_> {}
            impl PartialOrd for HeapRow<'_> {
                fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                    Some(self.cmp(other))
                }
            }
            impl Ord for HeapRow<'_> {
                fn cmp(&self, other: &Self) -> Ordering {
                    compare_rows(&self.row, &other.row, self.sort)
                }
            }

            let mut heap: BinaryHeap<HeapRow<'_>> = BinaryHeap::with_capacity(k + 1);
            for row in rows.drain(..) {
                heap.push(HeapRow {
                    row,
                    sort: &query.sort,
                });
                if heap.len() > k {
                    heap.pop();
                }
            }
            let mut kept: Vec<ResultRow> = heap.into_iter().map(|h| h.row).collect();
            kept.sort_by(|a, b| compare_rows(a, b, &query.sort));
            *rows = kept;
        }
    }
}

fn page(rows: Vec<ResultRow>, query: &Query) -> Vec<ResultRow> {
    let offset = query.offset.unwrap_or(0);
    rows.into_iter()
        .skip(offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect()
}
