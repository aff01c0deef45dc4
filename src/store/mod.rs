//! Persistence boundary for the ingest engine.
//!
//! [`TelemetryStore`] covers the non-transactional reads and appends;
//! [`ReconcileTx`] is one open transaction in which a single record is
//! reconciled. Two implementations ship: [`PgStore`] for production and
//! [`MemoryStore`] for tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    AlarmAssignment, Device, Gateway, HistoryEntry, LocationGroup, NewReading, NewSnapshot,
    Reading, ReadingUpdate, Snapshot, SnapshotUpdate,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

pub type StoreResult<T> = Result<T, StoreError>;

/// Most readings a device history query returns.
pub const DEVICE_HISTORY_LIMIT: i64 = 500;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Persist an inbound message verbatim for auditing.
    async fn record_message(&self, topic: &str, payload: &Value) -> StoreResult<()>;

    /// Look up an active gateway by upper-case MAC.
    async fn find_active_gateway(&self, mac: &str) -> StoreResult<Option<Gateway>>;

    /// Look up a device by upper-case BLE MAC.
    async fn find_device(&self, ble_mac: &str) -> StoreResult<Option<Device>>;

    /// Open a transaction for reconciling one record.
    async fn begin(&self) -> StoreResult<Box<dyn ReconcileTx>>;

    /// Every (active alarm, monitored device) pair.
    async fn alarm_assignments(&self) -> StoreResult<Vec<AlarmAssignment>>;

    /// Most recent snapshot `last_seen` for a device, across locations.
    async fn latest_last_seen(&self, device_id: Uuid) -> StoreResult<Option<DateTime<Utc>>>;

    /// Open a `triggered` event unless one is already open.
    ///
    /// Returns `true` when a new event row was created.
    async fn open_alarm_event(
        &self,
        alarm_id: Uuid,
        device_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Current snapshots grouped by location, named locations first in name
    /// order and the unlocated group last.
    async fn devices_by_location(&self) -> StoreResult<Vec<LocationGroup>>;

    /// Newest readings of one device across all locations, at most `limit`.
    async fn device_history(&self, device_id: Uuid, limit: i64) -> StoreResult<Vec<HistoryEntry>>;
}

/// One open transaction. Dropping it without `commit` discards all writes.
#[async_trait]
pub trait ReconcileTx: Send {
    /// Serialize writers of the same (device, location) pair until commit.
    async fn lock_pair(&mut self, device_id: Uuid, location_id: Option<Uuid>) -> StoreResult<()>;

    async fn latest_reading(
        &mut self,
        device_id: Uuid,
        location_id: Option<Uuid>,
    ) -> StoreResult<Option<Reading>>;

    async fn snapshot(
        &mut self,
        device_id: Uuid,
        location_id: Option<Uuid>,
    ) -> StoreResult<Option<Snapshot>>;

    async fn insert_reading(&mut self, reading: &NewReading) -> StoreResult<Uuid>;

    async fn update_reading(&mut self, id: Uuid, update: &ReadingUpdate) -> StoreResult<()>;

    async fn insert_snapshot(&mut self, snapshot: &NewSnapshot) -> StoreResult<Uuid>;

    async fn update_snapshot(&mut self, id: Uuid, update: &SnapshotUpdate) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}
