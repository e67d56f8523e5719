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

//! Batched writer toward the store.
//!
//! A dedicated task drains a bounded channel of pending rows and flushes
//! grouped batches when the row count, the wire-byte budget, or the time
//! threshold is hit. The bounded channel doubles as the ingest high
//! watermark: a full channel pauses the producer connection. Commit
//! failures retry with exponential backoff; a persistently failing flush
//! marks the writer unhealthy, which ingest reports as producer health
//! DOWN.

use sandflow_core::{BatchConfig, Result, SandflowError};
use sandflow_store::{Store, WriteOp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Commit retry budget on top of the driver's own retries.
const FLUSH_RETRY_LIMIT: u32 = 3;
const FLUSH_RETRY_BASE: Duration = Duration::from_millis(50);

/// Channel capacity; the ingest high watermark.
const CHANNEL_CAPACITY: usize = 8192;

#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    pub rows_submitted: u64,
    pub rows_written: u64,
    pub rows_dropped: u64,
    pub flushes: u64,
    pub flush_failures: u64,
}

#[derive(Default)]
struct WriterStatsInternal {
    rows_submitted: AtomicU64,
    rows_written: AtomicU64,
    rows_dropped: AtomicU64,
    flushes: AtomicU64,
    flush_failures: AtomicU64,
}

/// Handle used by the ingest pipeline.
pub struct BatchWriter {
    sender: mpsc::Sender<WriteOp>,
    stats: Arc<WriterStatsInternal>,
    healthy: Arc<AtomicBool>,
}

impl Clone for BatchWriter {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stats: self.stats.clone(),
            healthy: self.healthy.clone(),
        }
    }
}

impl BatchWriter {
    /// Spawn the writer task.
    pub fn spawn(store: Arc<Store>, config: BatchConfig) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let stats = Arc::new(WriterStatsInternal::default());
        let healthy = Arc::new(AtomicBool::new(true));

        let task_stats = stats.clone();
        let task_healthy = healthy.clone();
        tokio::spawn(async move {
            writer_loop(store, config, receiver, task_stats, task_healthy).await;
        });

        Self {
            sender,
            stats,
            healthy,
        }
    }

    /// Enqueue one row; suspends while the channel is at the watermark,
    /// which is what pauses the producer connection.
    pub async fn submit(&self, op: WriteOp) -> Result<()> {
        self.stats.rows_submitted.fetch_add(1, Ordering::Relaxed);
        self.sender
            .send(op)
            .await
            .map_err(|_| SandflowError::Internal("writer task gone".into()))
    }

    /// Remaining channel slots; zero means the watermark is hit.
    pub fn queue_slack(&self) -> usize {
        self.sender.capacity()
    }

    pub fn queue_depth(&self) -> usize {
        CHANNEL_CAPACITY - self.sender.capacity()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            rows_submitted: self.stats.rows_submitted.load(Ordering::Relaxed),
            rows_written: self.stats.rows_written.load(Ordering::Relaxed),
            rows_dropped: self.stats.rows_dropped.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            flush_failures: self.stats.flush_failures.load(Ordering::Relaxed),
        }
    }
}

async fn writer_loop(
    store: Arc<Store>,
    config: BatchConfig,
    mut receiver: mpsc::Receiver<WriteOp>,
    stats: Arc<WriterStatsInternal>,
    healthy: Arc<AtomicBool>,
) {
    let mut buffer: Vec<WriteOp> = Vec::with_capacity(config.max_rows);
    let mut buffered_bytes = 0usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(config.max_ms.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            op = receiver.recv() => {
                match op {
                    Some(op) => {
                        buffered_bytes += op.encoded_len();
                        buffer.push(op);
                        if buffer.len() >= config.max_rows || buffered_bytes >= config.max_bytes {
                            flush(&store, &mut buffer, &mut buffered_bytes, &stats, &healthy).await;
                        }
                    }
                    None => {
                        flush(&store, &mut buffer, &mut buffered_bytes, &stats, &healthy).await;
                        debug!("batch writer shutting down");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer, &mut buffered_bytes, &stats, &healthy).await;
                }
            }
        }
    }
}

async fn flush(
    store: &Store,
    buffer: &mut Vec<WriteOp>,
    buffered_bytes: &mut usize,
    stats: &WriterStatsInternal,
    healthy: &AtomicBool,
) {
    if buffer.is_empty() {
        return;
    }
    let rows = buffer.len() as u64;
    *buffered_bytes = 0;

    // Group into conforming single-partition batches.
    let mut grouped: HashMap<(String, String), Vec<WriteOp>> = HashMap::new();
    for op in buffer.drain(..) {
        grouped
            .entry((op.table.clone(), op.partition_key.clone()))
            .or_default()
            .push(op);
    }

    let mut delay = FLUSH_RETRY_BASE;
    let mut attempt = 0;
    loop {
        match commit_groups(store, &grouped) {
            Ok(()) => {
                stats.flushes.fetch_add(1, Ordering::Relaxed);
                stats.rows_written.fetch_add(rows, Ordering::Relaxed);
                if !healthy.swap(true, Ordering::Relaxed) {
                    warn!("batch writer recovered, marking healthy");
                }
                return;
            }
            Err(e) if attempt < FLUSH_RETRY_LIMIT => {
                attempt += 1;
                warn!(attempt, error = %e, "batch flush failed, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                error!(error = %e, rows, "batch flush failed permanently, dropping rows");
                stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                stats.rows_dropped.fetch_add(rows, Ordering::Relaxed);
                healthy.store(false, Ordering::Relaxed);
                return;
            }
        }
    }
}

fn commit_groups(store: &Store, grouped: &HashMap<(String, String), Vec<WriteOp>>) -> Result<()> {
    for ((table, _), ops) in grouped {
        let mut batch = store.batch(table);
        for op in ops {
            batch.add_insert(
                &op.partition_key,
                &op.clustering_key,
                op.value.clone(),
                op.ttl_seconds,
            );
        }
        batch.commit()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandflow_store::{CkRange, MemBackend, StoreBackend};

    fn op(table: &str, pk: &str, ck: &str) -> WriteOp {
        WriteOp {
            table: table.to_string(),
            partition_key: pk.to_string(),
            clustering_key: ck.to_string(),
            value: b"v".to_vec(),
            ttl_seconds: 0,
        }
    }

    #[tokio::test]
    async fn test_flush_on_row_threshold() {
        let backend = Arc::new(MemBackend::new());
        backend.create_table("t").unwrap();
        let store = Arc::new(Store::new(backend));

        let config = BatchConfig {
            max_rows: 4,
            max_bytes: 1 << 20,
            max_ms: 10_000, // effectively never by time
        };
        let writer = BatchWriter::spawn(store.clone(), config);

        for i in 0..4 {
            writer.submit(op("t", "p1", &format!("ck{}", i))).await.unwrap();
        }

        // Row threshold should flush without waiting for the ticker.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if store.count("t", "p1", &CkRange::all()).unwrap() == 4 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("rows should be flushed by count threshold");

        assert_eq!(writer.stats().rows_written, 4);
    }

    #[tokio::test]
    async fn test_flush_on_time_threshold() {
        let backend = Arc::new(MemBackend::new());
        backend.create_table("t").unwrap();
        let store = Arc::new(Store::new(backend));

        let config = BatchConfig {
            max_rows: 1000,
            max_bytes: 1 << 20,
            max_ms: 20,
        };
        let writer = BatchWriter::spawn(store.clone(), config);
        writer.submit(op("t", "p1", "only")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if store.count("t", "p1", &CkRange::all()).unwrap() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("row should be flushed by the time threshold");
    }

    #[tokio::test]
    async fn test_unknown_table_marks_unhealthy() {
        let backend = Arc::new(MemBackend::new());
        let store = Arc::new(Store::new(backend));

        let config = BatchConfig {
            max_rows: 1,
            max_bytes: 1 << 20,
            max_ms: 10,
        };
        let writer = BatchWriter::spawn(store, config);
        writer.submit(op("missing", "p1", "ck")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while writer.is_healthy() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("writer should mark itself unhealthy");
        assert_eq!(writer.stats().rows_dropped, 1);
    }
}
