//! Health check endpoints
//!
//! `/health` for liveness, `/ready` for load balancer admission,
//! `/metrics` for Prometheus and `/stats` for the pool snapshot.

use crate::metrics::PrometheusExporter;
use crate::nats::EventPublisher;
use crate::pool::ConnectionPool;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub pool_id: u64,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub pool_id: u64,
    pub connections: usize,
    pub capacity: usize,
    pub shut_down: bool,
    pub nats_connected: bool,
}

impl ReadyResponse {
    fn is_ready(&self) -> bool {
        !self.shut_down && self.connections < self.capacity && self.nats_connected
    }
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub pool: ConnectionPool,
    pub pool_id: u64,
    pub nats: Option<Arc<EventPublisher>>,
    pub exporter: PrometheusExporter,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        pool_id: state.pool_id,
    })
}

/// Readiness endpoint - 200 while the pool accepts new connections
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut response = ReadyResponse {
        ready: false,
        pool_id: state.pool_id,
        connections: state.pool.connection_count(),
        capacity: state.pool.capacity(),
        shut_down: state.pool.is_shut_down(),
        nats_connected: state.nats.as_ref().map_or(true, |n| n.is_connected()),
    };
    response.ready = response.is_ready();

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(ref nats) = state.nats {
        state.exporter.set_nats_connected(nats.is_connected());
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.exporter.render(),
    )
}

/// Stats endpoint - current pool snapshot as JSON
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.metrics_snapshot())
}
