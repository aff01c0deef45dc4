//! HTTP route gateway (EMBP): `main.rs` mounts [`router`] and nothing else.

use std::sync::Arc;

use axum::Router;

use crate::store::TelemetryStore;

mod devices;
mod health;

// ---

pub fn router(store: Arc<dyn TelemetryStore>) -> Router {
    // ---
    Router::new()
        .merge(devices::router())
        .merge(health::router())
        .with_state(store)
}
