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

//! Ingest listener.
//!
//! Accepts producer connections, optionally wraps them in mutual TLS,
//! and spawns one pipeline task per connection. A connection's errors
//! never propagate past its own task.

use crate::ingest::IngestPipeline;
use crate::tls;
use sandflow_core::{Result, SandflowError, TlsConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct CollectorServer {
    pipeline: Arc<IngestPipeline>,
    acceptor: Option<tokio_rustls::TlsAcceptor>,
}

impl CollectorServer {
    pub fn new(pipeline: Arc<IngestPipeline>, tls_config: &TlsConfig) -> Result<Self> {
        Ok(Self {
            pipeline,
            acceptor: tls::build_acceptor(tls_config)?,
        })
    }

    /// Bind and serve until `shutdown` fires. Returns the bound address
    /// through `bound` so callers can use port 0 in tests.
    pub async fn run(
        &self,
        addr: SocketAddr,
        bound: tokio::sync::oneshot::Sender<SocketAddr>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SandflowError::Config(format!("cannot bind ingest {}: {}", addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| SandflowError::Io(e.to_string()))?;
        let _ = bound.send(local);
        info!(addr = %local, tls = self.acceptor.is_some(), "ingest listener started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("ingest listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let pipeline = self.pipeline.clone();
                    let acceptor = self.acceptor.clone();
                    tokio::spawn(async move {
                        let result = match acceptor {
                            Some(acceptor) => match acceptor.accept(socket).await {
                                Ok(tls_stream) => pipeline.handle_connection(tls_stream).await,
                                Err(e) => Err(SandflowError::Auth(format!(
                                    "tls handshake with {}: {}",
                                    peer, e
                                ))),
                            },
                            None => pipeline.handle_connection(socket).await,
                        };
                        if let Err(e) = result {
                            warn!(peer = %peer, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchWriter;
    use crate::wire::{self, WirePayload, PROTOCOL_VERSION};
    use sandflow_core::message::MessageBuilder;
    use sandflow_core::{
        BatchConfig, MemCache, ProducerId, RetentionConfig, RuleMap, SharedCache,
    };
    use sandflow_store::{
        CkRange, Indexer, MemBackend, Store, SystemState, TableRegistry, MESSAGE_TABLE,
    };
    use sandflow_uve::UveAggregator;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn pipeline() -> (Arc<Store>, Arc<IngestPipeline>) {
        let registry = Arc::new(TableRegistry::standard(23));
        let store = Arc::new(Store::new(Arc::new(MemBackend::new())));
        registry.ensure_tables(&store).unwrap();
        let system =
            Arc::new(SystemState::load(store.clone(), RetentionConfig::default(), 1).unwrap());
        let cache: Arc<dyn SharedCache> = Arc::new(MemCache::new());
        let aggregator = Arc::new(UveAggregator::new(Arc::new(RuleMap::new()), cache.clone()));
        let indexer = Arc::new(Indexer::new(registry, RetentionConfig::default()));
        let writer = BatchWriter::spawn(
            store.clone(),
            BatchConfig {
                max_rows: 1,
                max_bytes: 1 << 20,
                max_ms: 5,
            },
        );
        let pipeline = Arc::new(IngestPipeline::new(indexer, writer, aggregator, cache, system));
        (store, pipeline)
    }

    #[tokio::test]
    async fn test_tcp_end_to_end() {
        let (store, pipeline) = pipeline();
        let server = CollectorServer::new(pipeline, &Default::default()).unwrap();

        let (bound_tx, bound_rx) = tokio::sync::oneshot::channel();
        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            server
                .run("127.0.0.1:0".parse().unwrap(), bound_tx, server_shutdown)
                .await
                .unwrap();
        });
        let addr = bound_rx.await.unwrap();

        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        wire::write_frame(
            &mut conn,
            &WirePayload::Handshake {
                producer_id: ProducerId::new("h1", "Agent", "0", "Compute"),
                version: PROTOCOL_VERSION,
                capabilities: vec![],
            },
        )
        .await
        .unwrap();
        let ack = wire::read_frame(&mut conn).await.unwrap().unwrap();
        assert!(matches!(ack, WirePayload::HandshakeAck { .. }));

        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_micros() as u64;
        let msg = MessageBuilder::new("h1", "Agent")
            .timestamp(ts)
            .message_type("AgentInfo")
            .build();
        let uuid = msg.uuid.to_string();
        wire::write_frame(&mut conn, &WirePayload::Telemetry(Box::new(msg)))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if store.count(MESSAGE_TABLE, &uuid, &CkRange::all()).unwrap() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("message should land in the store");

        shutdown.cancel();
    }
}
