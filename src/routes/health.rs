// src/routes/health.rs
//! Liveness endpoint.
//!
//! `GET /health` answers as long as the process is serving HTTP. It does not
//! touch the database or the broker, so an orchestrator restarting on failed
//! health checks only restarts a wedged process.

use axum::{routing::get, Json, Router};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Subrouter with `GET /health`, generic over the gateway's state type.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/health", get(health))
}
