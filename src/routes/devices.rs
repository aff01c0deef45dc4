// src/routes/devices.rs
//! Read-only device views over the reconciled tables.
//!
//! - `GET /locations/devices`: current snapshots grouped by location
//! - `GET /devices/{id}/history?limit=N`: newest readings of one device,
//!   `N` clamped to 1..=500 (default 500)

use std::sync::Arc;

use axum::{
    extract::Path, extract::Query, extract::State, http::StatusCode, response::IntoResponse,
    routing::get, Json, Router,
};
use serde::Deserialize;
use tracing::{debug, error};
use uuid::Uuid;

use crate::store::{TelemetryStore, DEVICE_HISTORY_LIMIT};

// ---

type Store = Arc<dyn TelemetryStore>;

pub fn router() -> Router<Store> {
    // ---
    Router::new()
        .route("/locations/devices", get(devices_by_location))
        .route("/devices/{id}/history", get(device_history))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn devices_by_location(State(store): State<Store>) -> impl IntoResponse {
    // ---
    match store.devices_by_location().await {
        Ok(groups) => {
            debug!(locations = groups.len(), "GET /locations/devices");
            (StatusCode::OK, Json(groups)).into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to load device snapshots");
            (StatusCode::INTERNAL_SERVER_ERROR, Json("Failed to load devices")).into_response()
        }
    }
}

async fn device_history(
    Path(device_id): Path<Uuid>,
    Query(params): Query<HistoryQuery>,
    State(store): State<Store>,
) -> impl IntoResponse {
    // ---
    let limit = params
        .limit
        .unwrap_or(DEVICE_HISTORY_LIMIT)
        .clamp(1, DEVICE_HISTORY_LIMIT);

    match store.device_history(device_id, limit).await {
        Ok(entries) => {
            debug!(%device_id, limit, returned = entries.len(), "GET /devices/{{id}}/history");
            (StatusCode::OK, Json(entries)).into_response()
        }
        Err(e) => {
            error!(%device_id, error = %e, "failed to load device history");
            (StatusCode::INTERNAL_SERVER_ERROR, Json("Failed to load history")).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{NewReading, NewSnapshot};
    use crate::store::{MemoryStore, ReconcileTx};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::Value;

    async fn body_json(response: axum::response::Response) -> Value {
        // ---
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn store_with_history(readings: i64) -> (MemoryStore, Uuid) {
        // ---
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();
        let gateway = store.add_gateway("aa:bb:cc:dd:ee:01", None, true).await;
        let device = store.add_device("11:22:33:44:55:66").await;

        let mut tx = store.begin().await.unwrap();
        for minute in 0..readings {
            tx.insert_reading(&NewReading {
                device_id: device,
                gateway_id: gateway,
                location_id: None,
                rssi: Some(-60),
                adv_type: None,
                raw_data: None,
                battery_voltage: None,
                temperature: None,
                humidity: None,
                status: None,
                seen_at: t0 + Duration::minutes(minute),
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();
        (store, device)
    }

    #[tokio::test]
    async fn test_history_limit_is_clamped() {
        // ---
        let (store, device) = store_with_history(3).await;
        let store: Store = Arc::new(store);

        for (limit, expected) in [(None, 3), (Some(2), 2), (Some(0), 1), (Some(-5), 1), (Some(10_000), 3)] {
            let response = device_history(
                Path(device),
                Query(HistoryQuery { limit }),
                State(Arc::clone(&store)),
            )
            .await
            .into_response();

            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body.as_array().unwrap().len(), expected, "limit {limit:?}");
        }
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        // ---
        let (store, device) = store_with_history(2).await;

        let response = device_history(
            Path(device),
            Query(HistoryQuery::default()),
            State(Arc::new(store) as Store),
        )
        .await
        .into_response();

        let body = body_json(response).await;
        assert_eq!(body[0]["seen_at"], "2025-03-26T18:46:00Z");
        assert_eq!(body[1]["seen_at"], "2025-03-26T18:45:00Z");
        assert!(body[0]["gateway_name"].is_null());
    }

    #[tokio::test]
    async fn test_devices_by_location_lists_snapshots() {
        // ---
        let store = MemoryStore::new();
        let empty = devices_by_location(State(Arc::new(store.clone()) as Store))
            .await
            .into_response();
        assert_eq!(body_json(empty).await, serde_json::json!([]));

        let cold_room = store.add_location("Cold room").await;
        let device = store.add_device("11:22:33:44:55:66").await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_snapshot(&NewSnapshot {
            device_id: device,
            location_id: Some(cold_room),
            gateway_id: None,
            last_seen: Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap(),
            status: Some("ok".to_string()),
            battery_voltage: Some(3.1),
            temperature: None,
            humidity: None,
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let response = devices_by_location(State(Arc::new(store) as Store))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["location_name"], "Cold room");
        assert_eq!(body[0]["devices"][0]["ble_mac"], "11:22:33:44:55:66");
        assert_eq!(body[0]["devices"][0]["battery_voltage"], 3.1);
    }
}
