//! Status HTTP server.
//!
//! `GET /health` for liveness probes, `GET /status` for per-type cursors,
//! stored row counts and the metrics snapshot.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::error;
use types::event::EventType;

use crate::ingestion::Ingestor;
use crate::metrics::{IndexerMetrics, MetricsSnapshot};
use crate::reconcile::ReconciliationSweep;
use crate::store::{EventStore, StoreError};

#[derive(Clone)]
pub struct StatusState {
    pub ingestors: Vec<Arc<Ingestor>>,
    pub sweep: Arc<ReconciliationSweep>,
    pub store: Arc<dyn EventStore>,
    pub metrics: Arc<IndexerMetrics>,
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl IntoResponse for StatusError {
    fn into_response(self) -> Response {
        error!(error = %self, "Status request failed");
        let body = Json(json!({
            "error": "STORE_UNAVAILABLE",
            "message": self.to_string()
        }));
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeStatus {
    pub event_type: EventType,
    /// `None` until the first cycle has initialized it.
    pub cursor: Option<u64>,
    pub stored: u64,
    pub cycle_running: bool,
    pub sweep_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub types: Vec<TypeStatus>,
    pub metrics: MetricsSnapshot,
}

pub fn create_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "indexer",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn status(State(state): State<StatusState>) -> Result<Json<StatusResponse>, StatusError> {
    let mut types = Vec::with_capacity(state.ingestors.len());
    for ingestor in &state.ingestors {
        let event_type = ingestor.event_type();
        types.push(TypeStatus {
            event_type,
            cursor: ingestor.cursor(),
            stored: state.store.count(event_type)?,
            cycle_running: ingestor.is_running(),
            sweep_running: state.sweep.is_running(event_type),
        });
    }

    Ok(Json(StatusResponse {
        types,
        metrics: state.metrics.snapshot(),
    }))
}
