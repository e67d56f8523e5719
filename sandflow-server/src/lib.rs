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

//! Sandflow Server
//!
//! Wires the pipeline together: store backend, schema, system state,
//! UVE aggregator, ingest listener, query engine, retention, and the
//! JSON control surface.

pub mod api;
pub mod rules;

use api::AppState;
use axum::routing::{get, post};
use axum::Router;
use sandflow_collector::{BatchWriter, CollectorServer, IngestPipeline};
use sandflow_core::{
    MemCache, Result, SandflowConfig, SandflowError, SharedCache,
};
use sandflow_query::QueryEngine;
use sandflow_store::{
    Indexer, KeyspaceProperties, MemBackend, RetentionManager, Store, StoreBackend, SystemState,
    TableRegistry, WalBackend,
};
use sandflow_uve::UveAggregator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// TTL sweep cadence.
const RETENTION_INTERVAL: Duration = Duration::from_secs(60);
/// Subscription garbage-collection cadence.
const SUBSCRIPTION_GC_INTERVAL: Duration = Duration::from_secs(10);

fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Stats tables registered at startup; the set is data, kept here so a
/// deployment can extend it without touching the indexer.
fn register_stat_tables(registry: &TableRegistry) {
    registry.register_stat_table(
        "StatTable.NodeStatus.process_mem_cpu_usage",
        vec!["name".into(), "host".into()],
    );
    registry.register_stat_table(
        "StatTable.VirtualMachineStats.cpu_stats",
        vec!["name".into()],
    );
    registry.register_stat_table(
        "StatTable.FieldNames.fields",
        vec!["name".into(), "fields.value".into()],
    );
}

fn open_store(config: &SandflowConfig) -> Result<Arc<Store>> {
    let backend: Arc<dyn StoreBackend> = match config.store.backend.as_str() {
        "memory" => Arc::new(MemBackend::new()),
        "wal" => Arc::new(
            WalBackend::open(&config.store.data_dir)
                .map_err(|e| SandflowError::StoreUnavailable(e.to_string()))?,
        ),
        other => {
            return Err(SandflowError::Config(format!(
                "unknown store backend '{}'",
                other
            )))
        }
    };
    Ok(Arc::new(Store::new(backend)))
}

/// Build the control router over shared state.
pub fn control_router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(api::query))
        .route("/purge", post(api::purge))
        .route("/trace_buffer_request", post(api::trace_buffer_request))
        .route("/health", get(api::health))
        .route("/uves", get(api::uves))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state)
}

/// The query-port router exposes the query surface only.
pub fn query_router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(api::query))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the full stack until ctrl-c or `shutdown` fires.
pub async fn run_server(config: SandflowConfig, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;

    info!("starting sandflow");

    // Storage stack.
    let store = open_store(&config)?;
    let registry = Arc::new(
        TableRegistry::standard(config.partition_bits).with_properties(KeyspaceProperties {
            replication_factor: config.store.replication_factor,
            consistency_level: config.store.consistency_level.clone(),
        }),
    );
    register_stat_tables(&registry);
    registry
        .ensure_tables(&store)
        .map_err(|e| SandflowError::StoreUnavailable(e.to_string()))?;
    let system = Arc::new(SystemState::load(
        store.clone(),
        config.ttl.to_retention(),
        now_usec(),
    )?);

    // Shared cache; the embedded implementation is selected when no
    // remote cache endpoints are configured.
    let cache: Arc<dyn SharedCache> = Arc::new(MemCache::new());

    // UVE aggregation.
    let aggregator = Arc::new(UveAggregator::new(
        Arc::new(rules::default_rules()),
        cache.clone(),
    ));

    // Ingest.
    let indexer = Arc::new(Indexer::new(registry.clone(), system.retention()));
    let writer = BatchWriter::spawn(store.clone(), config.batch.clone());
    let pipeline = Arc::new(IngestPipeline::new(
        indexer,
        writer,
        aggregator.clone(),
        cache.clone(),
        system.clone(),
    ));

    // Query.
    let engine = Arc::new(QueryEngine::new(
        store.clone(),
        registry.clone(),
        system.clone(),
        config.query.clone(),
    ));

    // Retention.
    let node_id = format!("sandflow-{}", uuid::Uuid::new_v4());
    let retention = Arc::new(RetentionManager::new(
        store.clone(),
        registry.clone(),
        system.clone(),
        cache.clone(),
        node_id,
    ));

    let state = AppState {
        engine,
        aggregator: aggregator.clone(),
        retention: retention.clone(),
        pipeline: pipeline.clone(),
        store: store.clone(),
        cache,
    };

    // Ingest listener.
    let collector = CollectorServer::new(pipeline, &config.tls)?;
    let ingest_addr: SocketAddr = format!("{}:{}", config.listen.bind_addr, config.listen.ingest_port)
        .parse()
        .map_err(|e| SandflowError::Config(format!("bad ingest address: {}", e)))?;
    let (ingest_bound_tx, _ingest_bound_rx) = tokio::sync::oneshot::channel();
    let ingest_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = collector.run(ingest_addr, ingest_bound_tx, ingest_shutdown).await {
            tracing::error!(error = %e, "ingest listener failed");
        }
    });

    // Periodic retention sweep.
    let sweep_retention = retention.clone();
    let sweep_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = sweep_shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let retention = sweep_retention.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        retention.enforce_ttl(now_usec())
                    })
                    .await;
                    match result {
                        Ok(Ok(job)) => {
                            if job.rows_deleted > 0 {
                                info!(rows_deleted = job.rows_deleted, "ttl sweep purged rows");
                            }
                        }
                        Ok(Err(SandflowError::Overloaded)) => {
                            // Another purge holds the lock; try next tick.
                        }
                        Ok(Err(e)) => tracing::warn!(error = %e, "ttl sweep failed"),
                        Err(e) => tracing::warn!(error = %e, "ttl sweep task panicked"),
                    }
                }
            }
        }
    });

    // Subscription GC.
    let gc_aggregator = aggregator;
    let gc_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SUBSCRIPTION_GC_INTERVAL);
        loop {
            tokio::select! {
                _ = gc_shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    gc_aggregator.subscriptions().gc(now_usec());
                }
            }
        }
    });

    // Control and query surfaces.
    let control_addr: SocketAddr =
        format!("{}:{}", config.listen.bind_addr, config.listen.control_port)
            .parse()
            .map_err(|e| SandflowError::Config(format!("bad control address: {}", e)))?;
    let query_addr: SocketAddr =
        format!("{}:{}", config.listen.bind_addr, config.listen.query_port)
            .parse()
            .map_err(|e| SandflowError::Config(format!("bad query address: {}", e)))?;

    let control_listener = tokio::net::TcpListener::bind(control_addr)
        .await
        .map_err(|e| SandflowError::Config(format!("cannot bind control {}: {}", control_addr, e)))?;
    let query_listener = tokio::net::TcpListener::bind(query_addr)
        .await
        .map_err(|e| SandflowError::Config(format!("cannot bind query {}: {}", query_addr, e)))?;

    info!(control = %control_addr, query = %query_addr, ingest = %ingest_addr, "sandflow listening");

    let control = axum::serve(control_listener, control_router(state.clone()));
    let query = axum::serve(query_listener, query_router(state));

    let serve_shutdown = shutdown.clone();
    tokio::select! {
        result = control.with_graceful_shutdown({
            let s = serve_shutdown.clone();
            async move { s.cancelled().await }
        }) => result.map_err(|e| SandflowError::Io(e.to_string()))?,
        result = query.with_graceful_shutdown({
            let s = serve_shutdown.clone();
            async move { s.cancelled().await }
        }) => result.map_err(|e| SandflowError::Io(e.to_string()))?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            shutdown.cancel();
        }
    }

    Ok(())
}
