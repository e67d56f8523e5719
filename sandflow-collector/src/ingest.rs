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

//! Ingest pipeline.
//!
//! One cooperative task per producer connection: decode, validate, clamp
//! the timestamp into `[analytics_epoch, now + skew]`, coerce it
//! non-decreasing per (source, module, instance), classify, then fan out
//! to the batch writer and the UVE aggregator. Back-pressure comes from
//! the writer's bounded channel: while it is full the connection simply
//! stops reading, which is the producer's signal to buffer.

use crate::batch::BatchWriter;
use crate::wire::{self, WirePayload};
use dashmap::DashMap;
use sandflow_core::{
    MessageKind, ProducerId, Result, SandflowError, SharedCache, StatSample, TableFamily,
    TelemetryMessage,
};
use sandflow_store::{Indexer, SystemState};
use sandflow_uve::UveAggregator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Allowed forward clock skew for producer timestamps.
pub const MAX_SKEW_USEC: u64 = 5 * 60 * 1_000_000;

/// Capacity of each connection's outbound frame queue (trace requests).
const OUTBOUND_CAPACITY: usize = 16;

fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Counters surfaced through `GET /health`.
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    pub messages: u64,
    pub flows: u64,
    pub stats_samples: u64,
    pub uve_fragments: u64,
    pub trace_responses: u64,
    pub dropped_invalid: u64,
    pub dropped_out_of_range: u64,
    pub producers: usize,
}

#[derive(Default)]
struct IngestStatsInternal {
    messages: AtomicU64,
    flows: AtomicU64,
    stats_samples: AtomicU64,
    uve_fragments: AtomicU64,
    trace_responses: AtomicU64,
    dropped_invalid: AtomicU64,
    dropped_out_of_range: AtomicU64,
}

/// Live connections, addressable for trace buffer requests.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: DashMap<ProducerId, mpsc::Sender<WirePayload>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn insert(&self, producer: ProducerId, sender: mpsc::Sender<WirePayload>) {
        self.conns.insert(producer, sender);
    }

    fn remove(&self, producer: &ProducerId) {
        self.conns.remove(producer);
    }

    /// Forward a trace buffer request to the matching connection.
    pub async fn request_trace_buffer(
        &self,
        source: &str,
        module: &str,
        instance_id: &str,
        buffer_name: &str,
    ) -> Result<()> {
        let sender = self
            .conns
            .iter()
            .find(|entry| {
                let p = entry.key();
                p.source == source && p.module == module && p.instance_id == instance_id
            })
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                SandflowError::Internal(format!(
                    "no connected producer {}:{}:{}",
                    source, module, instance_id
                ))
            })?;
        sender
            .send(WirePayload::TraceBufferRequest {
                buffer_name: buffer_name.to_string(),
            })
            .await
            .map_err(|_| SandflowError::Overloaded)
    }
}

pub struct IngestPipeline {
    indexer: Arc<Indexer>,
    writer: BatchWriter,
    aggregator: Arc<UveAggregator>,
    cache: Arc<dyn SharedCache>,
    system: Arc<SystemState>,
    registry: Arc<ConnectionRegistry>,
    /// Last accepted timestamp per (source, module, instance).
    last_timestamp: DashMap<String, u64>,
    next_sequence: AtomicU64,
    stats: IngestStatsInternal,
}

impl IngestPipeline {
    pub fn new(
        indexer: Arc<Indexer>,
        writer: BatchWriter,
        aggregator: Arc<UveAggregator>,
        cache: Arc<dyn SharedCache>,
        system: Arc<SystemState>,
    ) -> Self {
        Self {
            indexer,
            writer,
            aggregator,
            cache,
            system,
            registry: Arc::new(ConnectionRegistry::new()),
            last_timestamp: DashMap::new(),
            next_sequence: AtomicU64::new(0),
            stats: IngestStatsInternal::default(),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn writer(&self) -> &BatchWriter {
        &self.writer
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            messages: self.stats.messages.load(Ordering::Relaxed),
            flows: self.stats.flows.load(Ordering::Relaxed),
            stats_samples: self.stats.stats_samples.load(Ordering::Relaxed),
            uve_fragments: self.stats.uve_fragments.load(Ordering::Relaxed),
            trace_responses: self.stats.trace_responses.load(Ordering::Relaxed),
            dropped_invalid: self.stats.dropped_invalid.load(Ordering::Relaxed),
            dropped_out_of_range: self.stats.dropped_out_of_range.load(Ordering::Relaxed),
            producers: self.registry.len(),
        }
    }

    /// Drive one producer connection to completion. Frame and handshake
    /// errors fail this connection only.
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let assigned = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let (producer, version, _capabilities) = wire::accept(&mut stream, assigned).await?;
        info!(producer = %producer, version, "producer connected");

        let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.registry.insert(producer.clone(), outbound_tx);
        if let Err(e) = self.cache.add_generator(&producer) {
            warn!(error = %e, "cache unavailable, generator set not updated");
        }

        // Inbound frames and outbound trace requests interleave on the
        // same connection; split so the halves borrow independently.
        let (mut reader, mut writer) = tokio::io::split(stream);

        let result = loop {
            tokio::select! {
                frame = wire::read_frame(&mut reader) => {
                    match frame {
                        Ok(Some(payload)) => {
                            if let Err(e) = self.process(&producer, payload).await {
                                break Err(e);
                            }
                        }
                        Ok(None) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(payload) => {
                            if let Err(e) = wire::write_frame(&mut writer, &payload).await {
                                break Err(e);
                            }
                        }
                        None => break Ok(()),
                    }
                }
            }
        };

        self.registry.remove(&producer);
        if let Err(e) = self.cache.remove_generator(&producer) {
            warn!(error = %e, "cache unavailable, generator set not updated");
        }
        self.aggregator.producer_disconnected(&producer)?;
        info!(producer = %producer, "producer disconnected");
        result
    }

    /// Process one decoded frame from `producer`.
    pub async fn process(&self, producer: &ProducerId, payload: WirePayload) -> Result<()> {
        match payload {
            WirePayload::Telemetry(msg) => self.process_message(*msg).await,
            WirePayload::UveFragment(fragment) => {
                self.stats.uve_fragments.fetch_add(1, Ordering::Relaxed);
                self.aggregator.update(producer, &fragment, now_usec())
            }
            WirePayload::TraceBufferResponse {
                buffer_name,
                messages,
            } => {
                self.stats.trace_responses.fetch_add(1, Ordering::Relaxed);
                for mut msg in messages {
                    // Trace content is persisted as object logs under the
                    // TraceBuffer object type.
                    msg.kind = MessageKind::TraceBuffer;
                    msg.object_refs.insert(sandflow_core::ObjectRef::new(
                        "TraceBuffer",
                        &format!("{}:{}", producer.source, buffer_name),
                    ));
                    self.process_message(msg).await?;
                }
                Ok(())
            }
            WirePayload::Handshake { .. } | WirePayload::HandshakeAck { .. } => Err(
                SandflowError::Frame("handshake frame after connection setup".into()),
            ),
            WirePayload::TraceBufferRequest { .. } => Err(SandflowError::Frame(
                "trace buffer request from producer".into(),
            )),
        }
    }

    async fn process_message(&self, mut msg: TelemetryMessage) -> Result<()> {
        if let Err(reason) = msg.validate() {
            warn!(source = %msg.source, module = %msg.module, reason, "dropping invalid message");
            self.stats.dropped_invalid.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Clamp to [analytics_epoch, now + skew].
        let family = match msg.kind {
            MessageKind::Flow => TableFamily::Flow,
            MessageKind::Stat => TableFamily::Stats,
            _ => TableFamily::Global,
        };
        let epoch = self.system.epoch(family);
        let horizon = now_usec() + MAX_SKEW_USEC;
        if msg.timestamp_usec < epoch || msg.timestamp_usec > horizon {
            self.stats
                .dropped_out_of_range
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                timestamp = msg.timestamp_usec,
                epoch, horizon, "dropping out-of-range message"
            );
            return Ok(());
        }

        // Coerce non-decreasing per (source, module, instance).
        let clock_key = format!("{}:{}:{}", msg.source, msg.module, msg.instance_id);
        {
            let mut last = self.last_timestamp.entry(clock_key).or_insert(0);
            if msg.timestamp_usec < *last {
                msg.timestamp_usec = *last;
            } else {
                *last = msg.timestamp_usec;
            }
        }

        let ops = match msg.kind {
            MessageKind::Flow => {
                self.stats.flows.fetch_add(1, Ordering::Relaxed);
                let mut sample: sandflow_core::FlowSample =
                    serde_json::from_value(msg.payload.clone()).map_err(|e| {
                        SandflowError::Serialization(format!("flow payload: {}", e))
                    })?;
                sample.timestamp_usec = msg.timestamp_usec;
                self.indexer.flow_ops(&sample)?
            }
            MessageKind::Stat => {
                self.stats.stats_samples.fetch_add(1, Ordering::Relaxed);
                let mut sample: StatSample =
                    serde_json::from_value(msg.payload.clone()).map_err(|e| {
                        SandflowError::Serialization(format!("stat payload: {}", e))
                    })?;
                sample.timestamp_usec = msg.timestamp_usec;
                match self.indexer.stat_ops(&sample) {
                    Ok(ops) => ops,
                    Err(e) => {
                        warn!(table = %sample.table_name, error = %e, "dropping stat sample");
                        self.stats.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                }
            }
            MessageKind::UveFragment => {
                // Fragments arrive as their own wire kind; one smuggled in
                // a telemetry frame is invalid.
                self.stats.dropped_invalid.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            _ => {
                self.stats.messages.fetch_add(1, Ordering::Relaxed);
                self.indexer.message_ops(&msg)?
            }
        };

        for op in ops {
            self.writer.submit(op).await?;
        }
        Ok(())
    }
}
