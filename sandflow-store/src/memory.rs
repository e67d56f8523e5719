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

//! In-memory backend: the reference semantics for the store contract.
//!
//! Partitions are BTreeMaps so clustering order is the key order the
//! contract promises. Expired cells are invisible to reads and counted
//! out; physical removal is retention's job.

use crate::driver::{now_usec, CkRange, Row, StoreBackend, WriteBatch};
use parking_lot::RwLock;
use sandflow_core::{Result, SandflowError};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
struct Cell {
    value: Vec<u8>,
    write_time_usec: u64,
    expires_at_usec: Option<u64>,
}

impl Cell {
    fn live_at(&self, now: u64) -> bool {
        self.expires_at_usec.map_or(true, |exp| exp > now)
    }

    fn to_row(&self, clustering: &str) -> Row {
        Row {
            clustering: clustering.to_string(),
            value: self.value.clone(),
            write_time_usec: self.write_time_usec,
            expires_at_usec: self.expires_at_usec,
        }
    }
}

type Partition = BTreeMap<String, Cell>;
type Table = BTreeMap<String, Partition>;

/// BTreeMap-backed store.
#[derive(Default)]
pub struct MemBackend {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn expires_at(ttl_seconds: u32, now: u64) -> Option<u64> {
        if ttl_seconds == 0 {
            None
        } else {
            Some(now + ttl_seconds as u64 * 1_000_000)
        }
    }
}

fn unknown_table(table: &str) -> SandflowError {
    SandflowError::Internal(format!("unknown table '{}'", table))
}

/// BTreeMap::range panics on inverted bounds; an inverted request is
/// simply an empty scan.
fn range_is_inverted(range: &CkRange) -> bool {
    use std::ops::Bound;
    let start = match &range.start {
        Bound::Included(s) | Bound::Excluded(s) => s,
        Bound::Unbounded => return false,
    };
    let end = match &range.end {
        Bound::Included(e) | Bound::Excluded(e) => e,
        Bound::Unbounded => return false,
    };
    start > end
}

impl StoreBackend for MemBackend {
    fn create_table(&self, table: &str) -> Result<()> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_insert_with(Table::new);
        Ok(())
    }

    fn table_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn insert(
        &self,
        table: &str,
        partition_key: &str,
        clustering_key: &str,
        value: &[u8],
        ttl_seconds: u32,
    ) -> Result<()> {
        let now = now_usec();
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| unknown_table(table))?;
        t.entry(partition_key.to_string()).or_default().insert(
            clustering_key.to_string(),
            Cell {
                value: value.to_vec(),
                write_time_usec: now,
                expires_at_usec: Self::expires_at(ttl_seconds, now),
            },
        );
        Ok(())
    }

    fn apply(&self, batch: &WriteBatch) -> Result<()> {
        let now = now_usec();
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(&batch.table)
            .ok_or_else(|| unknown_table(&batch.table))?;
        let partition = t.entry(batch.partition_key.clone()).or_default();
        match batch.kind {
            crate::driver::BatchKind::Insert => {
                for (ck, value, ttl) in &batch.ops {
                    partition.insert(
                        ck.clone(),
                        Cell {
                            value: value.clone(),
                            write_time_usec: now,
                            expires_at_usec: Self::expires_at(*ttl, now),
                        },
                    );
                }
            }
            crate::driver::BatchKind::Remove => {
                for (ck, _, _) in &batch.ops {
                    partition.remove(ck);
                }
                if partition.is_empty() {
                    t.remove(&batch.partition_key);
                }
            }
        }
        Ok(())
    }

    fn get(
        &self,
        table: &str,
        partition_key: &str,
        range: &CkRange,
        limit: Option<usize>,
    ) -> Result<Vec<Row>> {
        if range_is_inverted(range) {
            return Ok(Vec::new());
        }
        let now = now_usec();
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| unknown_table(table))?;
        let Some(partition) = t.get(partition_key) else {
            return Ok(Vec::new());
        };
        let limit = limit.unwrap_or(usize::MAX);
        Ok(partition
            .range((range.start.clone(), range.end.clone()))
            .filter(|(_, cell)| cell.live_at(now))
            .take(limit)
            .map(|(ck, cell)| cell.to_row(ck))
            .collect())
    }

    fn partition_keys(&self, table: &str, limit: usize) -> Result<Vec<String>> {
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| unknown_table(table))?;
        Ok(t.keys().take(limit).cloned().collect())
    }

    fn count(&self, table: &str, partition_key: &str, range: &CkRange) -> Result<u64> {
        if range_is_inverted(range) {
            return Ok(0);
        }
        let now = now_usec();
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| unknown_table(table))?;
        let Some(partition) = t.get(partition_key) else {
            return Ok(0);
        };
        Ok(partition
            .range((range.start.clone(), range.end.clone()))
            .filter(|(_, cell)| cell.live_at(now))
            .count() as u64)
    }

    fn delete(
        &self,
        table: &str,
        partition_key: &str,
        clustering_key: Option<&str>,
    ) -> Result<u64> {
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| unknown_table(table))?;
        match clustering_key {
            Some(ck) => {
                let Some(partition) = t.get_mut(partition_key) else {
                    return Ok(0);
                };
                let removed = partition.remove(ck).map_or(0, |_| 1);
                if partition.is_empty() {
                    t.remove(partition_key);
                }
                Ok(removed)
            }
            None => Ok(t
                .remove(partition_key)
                .map_or(0, |partition| partition.len() as u64)),
        }
    }
}
