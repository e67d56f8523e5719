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

//! Control surface handlers.
//!
//! A small JSON-over-HTTP interface for internal collaborators: queries,
//! purge jobs, trace buffer requests, the live UVE view, and health.
//! Not a user API; authentication happens in front of it.

use axum::extract::{Query as UrlQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sandflow_collector::IngestPipeline;
use sandflow_core::{SandflowError, SharedCache};
use sandflow_query::{Query, QueryEngine};
use sandflow_store::{PurgeOutcome, RetentionManager, Store, StoreHealth};
use sandflow_uve::{SubscriptionFilter, UveAggregator};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueryEngine>,
    pub aggregator: Arc<UveAggregator>,
    pub retention: Arc<RetentionManager>,
    pub pipeline: Arc<IngestPipeline>,
    pub store: Arc<Store>,
    pub cache: Arc<dyn SharedCache>,
}

fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Error-to-status mapping for the whole surface.
fn error_response(e: SandflowError) -> Response {
    let (status, reason) = match &e {
        SandflowError::BelowRetention { .. } => (StatusCode::BAD_REQUEST, e.to_string()),
        SandflowError::UnsupportedPredicate(_) => (StatusCode::BAD_REQUEST, e.to_string()),
        SandflowError::QueryTimeout => (StatusCode::GATEWAY_TIMEOUT, e.to_string()),
        SandflowError::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        SandflowError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        SandflowError::CacheUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        SandflowError::Cancelled => (StatusCode::REQUEST_TIMEOUT, e.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    (
        status,
        Json(json!({ "ok": false, "partial": false, "reason": reason })),
    )
        .into_response()
}

/// POST /query
pub async fn query(State(state): State<AppState>, Json(query): Json<Query>) -> Response {
    match state.engine.execute(query).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    pub cutoff_usec: u64,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purge_id: String,
    pub already_ran: bool,
    pub rows_deleted: u64,
}

/// POST /purge
pub async fn purge(
    State(state): State<AppState>,
    Json(request): Json<PurgeRequest>,
) -> Response {
    let retention = state.retention.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        retention.purge(request.cutoff_usec, now_usec())
    })
    .await;

    match outcome {
        Ok(Ok(PurgeOutcome::Completed(job))) => Json(PurgeResponse {
            purge_id: job.id.to_string(),
            already_ran: false,
            rows_deleted: job.rows_deleted,
        })
        .into_response(),
        Ok(Ok(PurgeOutcome::AlreadyRan { purge_id })) => Json(PurgeResponse {
            purge_id: purge_id.to_string(),
            already_ran: true,
            rows_deleted: 0,
        })
        .into_response(),
        Ok(Err(e)) => error_response(e),
        Err(e) => error_response(SandflowError::Internal(e.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct TraceBufferRequest {
    pub source: String,
    pub module: String,
    #[serde(default = "default_instance")]
    pub instance_id: String,
    pub buffer_name: String,
}

fn default_instance() -> String {
    "0".to_string()
}

/// POST /trace_buffer_request
pub async fn trace_buffer_request(
    State(state): State<AppState>,
    Json(request): Json<TraceBufferRequest>,
) -> Response {
    match state
        .pipeline
        .connections()
        .request_trace_buffer(
            &request.source,
            &request.module,
            &request.instance_id,
            &request.buffer_name,
        )
        .await
    {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(SandflowError::Internal(reason)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "reason": reason })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    let ingest = state.pipeline.stats();
    let writer = state.pipeline.writer();
    let aggregator = state.aggregator.stats();
    let store_state = match state.store.health() {
        StoreHealth::Up => "up",
        StoreHealth::Down => "down",
    };
    let purge = state.retention.status().unwrap_or_default();

    let healthy = store_state == "up" && writer.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "ok": healthy,
            "store": store_state,
            "queue_depth": writer.queue_depth(),
            "producers": ingest.producers,
            "generators": state.cache.generators().unwrap_or_default(),
            "ingest": {
                "messages": ingest.messages,
                "flows": ingest.flows,
                "stats_samples": ingest.stats_samples,
                "uve_fragments": ingest.uve_fragments,
                "dropped_invalid": ingest.dropped_invalid,
                "dropped_out_of_range": ingest.dropped_out_of_range,
            },
            "writer": {
                "rows_written": writer.stats().rows_written,
                "rows_dropped": writer.stats().rows_dropped,
                "flush_failures": writer.stats().flush_failures,
            },
            "uve": {
                "entities": aggregator.entities,
                "updates": aggregator.updates,
                "subscriptions": aggregator.subscriptions,
            },
            "purge": purge,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct UveQuery {
    pub object_type: Option<String>,
    pub key_glob: Option<String>,
}

/// GET /uves?object_type=…&key_glob=…
pub async fn uves(
    State(state): State<AppState>,
    UrlQuery(params): UrlQuery<UveQuery>,
) -> Response {
    let filter = SubscriptionFilter {
        object_types: params.object_type.map(|t| vec![t]),
        key_glob: params.key_glob,
        ..Default::default()
    };
    let compiled = match filter.compile() {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "reason": format!("bad key glob: {}", e) })),
            )
                .into_response()
        }
    };

    let entries: Vec<serde_json::Value> = state
        .aggregator
        .snapshot(&compiled)
        .into_iter()
        .map(|(key, value)| {
            json!({
                "object_type": key.object_type,
                "object_key": key.object_key,
                "value": value,
            })
        })
        .collect();

    Json(json!({ "ok": true, "degraded": false, "uves": entries })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use sandflow_core::{
        BatchConfig, MemCache, ProducerId, QueryConfig, RetentionConfig, RuleMap, UveFragment,
    };
    use sandflow_collector::BatchWriter;
    use sandflow_store::{Indexer, MemBackend, SystemState, TableRegistry};
    use tower::util::ServiceExt;

    fn state() -> AppState {
        let registry = Arc::new(TableRegistry::standard(23));
        let store = Arc::new(Store::new(Arc::new(MemBackend::new())));
        registry.ensure_tables(&store).unwrap();
        let system =
            Arc::new(SystemState::load(store.clone(), RetentionConfig::default(), 1).unwrap());
        let cache: Arc<dyn SharedCache> = Arc::new(MemCache::new());
        let aggregator = Arc::new(UveAggregator::new(Arc::new(RuleMap::new()), cache.clone()));
        let indexer = Arc::new(Indexer::new(registry.clone(), RetentionConfig::default()));
        let writer = BatchWriter::spawn(store.clone(), BatchConfig::default());
        let pipeline = Arc::new(IngestPipeline::new(
            indexer,
            writer,
            aggregator.clone(),
            cache.clone(),
            system.clone(),
        ));
        let engine = Arc::new(QueryEngine::new(
            store.clone(),
            registry.clone(),
            system.clone(),
            QueryConfig::default(),
        ));
        let retention = Arc::new(RetentionManager::new(
            store.clone(),
            registry,
            system,
            cache.clone(),
            "test-node".into(),
        ));
        AppState {
            engine,
            aggregator,
            retention,
            pipeline,
            store,
            cache,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = crate::control_router(state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["store"], json!("up"));
    }

    #[tokio::test]
    async fn test_query_endpoint_rejects_bad_predicate() {
        let app = crate::control_router(state());
        let query = json!({
            "table": "MessageTable",
            "start_time_usec": 0,
            "end_time_usec": 100,
            "select": ["uuid"],
            "where": [[{"column": "Source", "op": "contains", "value": "h"}]]
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/query")
                    .header("content-type", "application/json")
                    .body(Body::from(query.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["ok"], json!(false));
    }

    #[tokio::test]
    async fn test_purge_endpoint_idempotent() {
        let app_state = state();
        let app = crate::control_router(app_state);
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/purge")
                .header("content-type", "application/json")
                .body(Body::from(json!({"cutoff_usec": 1 << 23}).to_string()))
                .unwrap()
        };

        let first = body_json(app.clone().oneshot(request()).await.unwrap()).await;
        assert_eq!(first["already_ran"], json!(false));

        let second = body_json(app.oneshot(request()).await.unwrap()).await;
        assert_eq!(second["already_ran"], json!(true));
        assert_eq!(second["purge_id"], first["purge_id"]);
    }

    #[tokio::test]
    async fn test_uves_endpoint_filters() {
        let app_state = state();
        let producer = ProducerId::new("h1", "Agent", "0", "Compute");
        app_state
            .aggregator
            .update(
                &producer,
                &UveFragment {
                    object_type: "VirtualNetwork".into(),
                    object_key: "vn1".into(),
                    struct_name: "Stats".into(),
                    attr_name: "tx_pkts".into(),
                    value: Some(json!(4)),
                },
                1,
            )
            .unwrap();

        let app = crate::control_router(app_state);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/uves?object_type=VirtualNetwork")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["uves"].as_array().unwrap().len(), 1);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/uves?object_type=VirtualRouter")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["uves"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trace_buffer_request_unknown_producer_404() {
        let app = crate::control_router(state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/trace_buffer_request")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({
                            "source": "h9",
                            "module": "Agent",
                            "buffer_name": "flow_trace"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
