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

//! Store driver: the back-end-independent contract plus the `Store`
//! wrapper that adds health tracking, bounded retries, batch-contract
//! enforcement, and operation counters.
//!
//! Batches are unlogged and restricted to one partition key and one
//! operation kind. A batch that mixes partitions or kinds is split into
//! conforming sub-batches with a warning rather than rejected; the
//! contract exists so a client-server backend can map each sub-batch to
//! a single atomic unit.

use sandflow_core::{Result, SandflowError};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// One stored cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub clustering: String,
    pub value: Vec<u8>,
    /// Microsecond write timestamp, surfaced when the caller asked for it.
    pub write_time_usec: u64,
    /// Absolute expiry; None means no TTL.
    pub expires_at_usec: Option<u64>,
}

/// Clustering-key range inside one partition.
#[derive(Debug, Clone)]
pub struct CkRange {
    pub start: Bound<String>,
    pub end: Bound<String>,
}

impl CkRange {
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Every clustering key starting with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        Self {
            start: Bound::Included(prefix.to_string()),
            end: Bound::Included(crate::keys::prefix_upper_bound(prefix)),
        }
    }

    /// Inclusive range.
    pub fn between(start: &str, end: &str) -> Self {
        Self {
            start: Bound::Included(start.to_string()),
            end: Bound::Included(end.to_string()),
        }
    }

    /// Restart point for a lazy scan: everything strictly after `ck`.
    pub fn after(&self, ck: &str) -> Self {
        Self {
            start: Bound::Excluded(ck.to_string()),
            end: self.end.clone(),
        }
    }

    pub fn contains(&self, ck: &str) -> bool {
        let lower_ok = match &self.start {
            Bound::Included(s) => ck >= s.as_str(),
            Bound::Excluded(s) => ck > s.as_str(),
            Bound::Unbounded => true,
        };
        let upper_ok = match &self.end {
            Bound::Included(e) => ck <= e.as_str(),
            Bound::Excluded(e) => ck < e.as_str(),
            Bound::Unbounded => true,
        };
        lower_ok && upper_ok
    }
}

/// Batch operation kind; a conforming batch carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Insert,
    Remove,
}

/// One pending write, as produced by the indexer.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub table: String,
    pub partition_key: String,
    pub clustering_key: String,
    pub value: Vec<u8>,
    /// Seconds; zero means the table default.
    pub ttl_seconds: u32,
}

impl WriteOp {
    pub fn encoded_len(&self) -> usize {
        self.partition_key.len() + self.clustering_key.len() + self.value.len()
    }
}

/// A conforming batch: one table, one partition, one kind.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    pub table: String,
    pub partition_key: String,
    pub kind: BatchKind,
    /// (clustering_key, value, ttl_seconds); value/ttl unused for Remove.
    pub ops: Vec<(String, Vec<u8>, u32)>,
}

/// Backend contract shared by the legacy and modern engines.
///
/// Reads and writes are quorum; the embedded backends satisfy that by
/// making every applied mutation immediately visible.
pub trait StoreBackend: Send + Sync {
    /// Idempotent table creation.
    fn create_table(&self, table: &str) -> Result<()>;

    fn table_names(&self) -> Result<Vec<String>>;

    fn insert(
        &self,
        table: &str,
        partition_key: &str,
        clustering_key: &str,
        value: &[u8],
        ttl_seconds: u32,
    ) -> Result<()>;

    /// Apply a conforming batch as one unit.
    fn apply(&self, batch: &WriteBatch) -> Result<()>;

    /// Bounded range read inside one partition, ascending clustering order.
    fn get(
        &self,
        table: &str,
        partition_key: &str,
        range: &CkRange,
        limit: Option<usize>,
    ) -> Result<Vec<Row>>;

    /// Partition keys in key order, up to `limit`. Retention only.
    fn partition_keys(&self, table: &str, limit: usize) -> Result<Vec<String>>;

    fn count(&self, table: &str, partition_key: &str, range: &CkRange) -> Result<u64>;

    /// Delete one cell, or the whole partition when `clustering_key` is None.
    fn delete(
        &self,
        table: &str,
        partition_key: &str,
        clustering_key: Option<&str>,
    ) -> Result<u64>;
}

/// Current microseconds since epoch.
pub(crate) fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Driver health, published on transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    Up,
    Down,
}

/// Operation counters.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub scans: u64,
    pub batch_commits: u64,
    pub batch_splits: u64,
    pub retries: u64,
}

#[derive(Default)]
struct StatsInternal {
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    scans: AtomicU64,
    batch_commits: AtomicU64,
    batch_splits: AtomicU64,
    retries: AtomicU64,
}

/// Retry budget for transient backend failures.
const RETRY_LIMIT: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(20);

/// The driver callers hold: backend + health + retries + stats.
pub struct Store {
    backend: Arc<dyn StoreBackend>,
    healthy: AtomicBool,
    stats: StatsInternal,
}

impl Store {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            healthy: AtomicBool::new(true),
            stats: StatsInternal::default(),
        }
    }

    pub fn health(&self) -> StoreHealth {
        if self.healthy.load(Ordering::Relaxed) {
            StoreHealth::Up
        } else {
            StoreHealth::Down
        }
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            puts: self.stats.puts.load(Ordering::Relaxed),
            gets: self.stats.gets.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            scans: self.stats.scans.load(Ordering::Relaxed),
            batch_commits: self.stats.batch_commits.load(Ordering::Relaxed),
            batch_splits: self.stats.batch_splits.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
        }
    }

    pub fn create_table(&self, table: &str) -> Result<()> {
        self.backend.create_table(table)
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        self.backend.table_names()
    }

    pub fn insert(
        &self,
        table: &str,
        partition_key: &str,
        clustering_key: &str,
        value: &[u8],
        ttl_seconds: u32,
    ) -> Result<()> {
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        self.with_retries(|| {
            self.backend
                .insert(table, partition_key, clustering_key, value, ttl_seconds)
        })
    }

    /// Start a batch against one table.
    pub fn batch(&self, table: &str) -> Batch<'_> {
        Batch {
            store: self,
            table: table.to_string(),
            inserts: Vec::new(),
            removes: Vec::new(),
        }
    }

    /// Lazy, restartable range scan inside one partition.
    pub fn get(
        &self,
        table: &str,
        partition_key: &str,
        range: CkRange,
        limit: Option<usize>,
    ) -> RangeScan {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        RangeScan {
            backend: self.backend.clone(),
            table: table.to_string(),
            partition_key: partition_key.to_string(),
            range,
            remaining: limit,
            page: Vec::new(),
            page_pos: 0,
            done: false,
        }
    }

    /// Eager convenience read used by the indexer and tests.
    pub fn get_all(
        &self,
        table: &str,
        partition_key: &str,
        range: &CkRange,
        limit: Option<usize>,
    ) -> Result<Vec<Row>> {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        self.with_retries(|| self.backend.get(table, partition_key, range, limit))
    }

    /// Cross-partition walk in key order. Used by retention only.
    pub fn get_range(&self, table: &str, limit: usize) -> Result<Vec<String>> {
        self.stats.scans.fetch_add(1, Ordering::Relaxed);
        self.with_retries(|| self.backend.partition_keys(table, limit))
    }

    pub fn count(&self, table: &str, partition_key: &str, range: &CkRange) -> Result<u64> {
        self.with_retries(|| self.backend.count(table, partition_key, range))
    }

    pub fn delete(
        &self,
        table: &str,
        partition_key: &str,
        clustering_key: Option<&str>,
    ) -> Result<u64> {
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        self.with_retries(|| self.backend.delete(table, partition_key, clustering_key))
    }

    fn commit_batch(&self, batch: &WriteBatch) -> Result<()> {
        self.stats.batch_commits.fetch_add(1, Ordering::Relaxed);
        self.with_retries(|| self.backend.apply(batch))
    }

    fn with_retries<T>(&self, op: impl Fn() -> Result<T>) -> Result<T> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => {
                    if !self.healthy.swap(true, Ordering::Relaxed) {
                        info!("store transitioned DOWN -> UP");
                    }
                    return Ok(v);
                }
                Err(e) if e.is_transient() && attempt < RETRY_LIMIT => {
                    attempt += 1;
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(attempt, error = %e, "store operation failed, retrying");
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => {
                    if e.is_transient() && self.healthy.swap(false, Ordering::Relaxed) {
                        warn!(error = %e, "store transitioned UP -> DOWN");
                    }
                    return Err(match e {
                        e if e.is_transient() => {
                            SandflowError::StoreUnavailable(e.to_string())
                        }
                        other => other,
                    });
                }
            }
        }
    }
}

/// Builder handed to callers; enforces the single-partition single-kind
/// contract at commit by splitting non-conforming inputs.
pub struct Batch<'a> {
    store: &'a Store,
    table: String,
    inserts: Vec<(String, String, Vec<u8>, u32)>,
    removes: Vec<(String, String)>,
}

impl<'a> Batch<'a> {
    pub fn add_insert(
        &mut self,
        partition_key: &str,
        clustering_key: &str,
        value: Vec<u8>,
        ttl_seconds: u32,
    ) {
        self.inserts.push((
            partition_key.to_string(),
            clustering_key.to_string(),
            value,
            ttl_seconds,
        ));
    }

    pub fn add_remove(&mut self, partition_key: &str, clustering_key: &str) {
        self.removes
            .push((partition_key.to_string(), clustering_key.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.removes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.removes.len()
    }

    /// Commit, splitting into conforming sub-batches as needed.
    pub fn commit(self) -> Result<()> {
        let mixed_kinds = !self.inserts.is_empty() && !self.removes.is_empty();

        let mut sub_batches: Vec<WriteBatch> = Vec::new();

        for (pk, ck, value, ttl) in self.inserts {
            match sub_batches
                .iter_mut()
                .find(|b| b.kind == BatchKind::Insert && b.partition_key == pk)
            {
                Some(batch) => batch.ops.push((ck, value, ttl)),
                None => sub_batches.push(WriteBatch {
                    table: self.table.clone(),
                    partition_key: pk,
                    kind: BatchKind::Insert,
                    ops: vec![(ck, value, ttl)],
                }),
            }
        }

        for (pk, ck) in self.removes {
            match sub_batches
                .iter_mut()
                .find(|b| b.kind == BatchKind::Remove && b.partition_key == pk)
            {
                Some(batch) => batch.ops.push((ck, Vec::new(), 0)),
                None => sub_batches.push(WriteBatch {
                    table: self.table.clone(),
                    partition_key: pk,
                    kind: BatchKind::Remove,
                    ops: vec![(ck, Vec::new(), 0)],
                }),
            }
        }

        if mixed_kinds || sub_batches.len() > 1 {
            self.store.stats.batch_splits.fetch_add(1, Ordering::Relaxed);
            warn!(
                table = %self.table,
                sub_batches = sub_batches.len(),
                mixed_kinds,
                "batch violates single-partition/single-kind contract, splitting"
            );
        }

        for batch in &sub_batches {
            self.store.commit_batch(batch)?;
        }
        Ok(())
    }
}

/// Lazy iterator over one partition; fetches pages and restarts from the
/// last clustering key, so a long scan never holds a backend snapshot.
pub struct RangeScan {
    backend: Arc<dyn StoreBackend>,
    table: String,
    partition_key: String,
    range: CkRange,
    remaining: Option<usize>,
    page: Vec<Row>,
    page_pos: usize,
    done: bool,
}

impl RangeScan {
    const PAGE_SIZE: usize = 512;
}

impl Iterator for RangeScan {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }

        if self.page_pos >= self.page.len() {
            if self.done {
                return None;
            }
            let page = match self.backend.get(
                &self.table,
                &self.partition_key,
                &self.range,
                Some(Self::PAGE_SIZE),
            ) {
                Ok(rows) => rows,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if page.len() < Self::PAGE_SIZE {
                self.done = true;
            }
            if let Some(last) = page.last() {
                self.range = self.range.after(&last.clustering);
            }
            self.page = page;
            self.page_pos = 0;
            if self.page.is_empty() {
                return None;
            }
        }

        let row = self.page[self.page_pos].clone();
        self.page_pos += 1;
        if let Some(n) = self.remaining.as_mut() {
            *n -= 1;
        }
        Some(Ok(row))
    }
}
