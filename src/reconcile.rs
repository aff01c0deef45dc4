//! Reconciliation of normalized records against per-device state.
//!
//! For every record the engine resolves gateway and device, then decides
//! inside one transaction whether the observation is a duplicate, a
//! snapshot-only refresh, a continuation of the last reading, or a fresh
//! reading. Writers of the same (device, location) pair are serialized by an
//! in-process keyed lock and by [`ReconcileTx::lock_pair`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::decoders::aliases;
use crate::decoders::helpers::{first_metric, first_present, number_value, round_metric};
use crate::models::{Device, Gateway, NewReading, NewSnapshot, NormalizedRecord};
use crate::models::{ReadingUpdate, SnapshotUpdate};
use crate::store::{ReconcileTx, StoreResult, TelemetryStore};

// ---

/// Repeats of the same pair closer than this are bursty re-broadcasts.
pub const DEDUP_WINDOW_MS: i64 = 5_000;

/// Below this snapshot age only the snapshot is refreshed.
pub const NO_ACTION_WINDOW_MS: i64 = 30_000;

/// Up to this snapshot age the latest reading is updated in place.
pub const COALESCE_WINDOW_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    GatewayNotRegistered,
    DeviceNotRegistered,
    DuplicateSameLocationWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RecentlySeen,
    /// Stamped before the snapshot's `last_seen`; nothing is written.
    OutOfOrder,
}

/// Result of reconciling one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ignored(IgnoreReason),
    Skipped(SkipReason),
    Updated(Uuid),
    Inserted(Uuid),
    Error(String),
}

impl IgnoreReason {
    pub fn as_str(self) -> &'static str {
        match self {
            IgnoreReason::GatewayNotRegistered => "gateway_not_registered",
            IgnoreReason::DeviceNotRegistered => "device_not_registered",
            IgnoreReason::DuplicateSameLocationWindow => "duplicate_same_location_window",
        }
    }
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::RecentlySeen => "recently_seen",
            SkipReason::OutOfOrder => "out_of_order",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        match self {
            Outcome::Ignored(reason) => write!(f, "ignored: {}", reason.as_str()),
            Outcome::Skipped(reason) => write!(f, "skipped: {}", reason.as_str()),
            Outcome::Updated(id) => write!(f, "updated: {id}"),
            Outcome::Inserted(id) => write!(f, "inserted: {id}"),
            Outcome::Error(detail) => write!(f, "error: {detail}"),
        }
    }
}

// ---

type PairKey = (Uuid, Option<Uuid>);

/// Async mutexes keyed by (device, location), created on demand and
/// dropped once no writer holds them.
#[derive(Debug, Default)]
pub struct PairLocks {
    inner: Mutex<HashMap<PairKey, Weak<tokio::sync::Mutex<()>>>>,
}

impl PairLocks {
    pub async fn acquire(&self, key: PairKey) -> tokio::sync::OwnedMutexGuard<()> {
        // ---
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            map.retain(|_, weak| weak.strong_count() > 0);
            match map.get(&key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(tokio::sync::Mutex::new(()));
                    map.insert(key, Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Number of pairs currently locked or awaited.
    pub fn active(&self) -> usize {
        // ---
        let map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

// ---

pub struct Reconciler {
    store: Arc<dyn TelemetryStore>,
    locks: PairLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self {
            store,
            locks: PairLocks::default(),
        }
    }

    /// Reconcile one record received on `topic` at `now`.
    ///
    /// Never fails: unknown entities are `Ignored`, store failures roll back
    /// and surface as `Error`.
    #[instrument(name = "reconcile", skip_all, fields(topic = %topic, ble_mac = %record.ble_mac))]
    pub async fn reconcile(&self, record: &NormalizedRecord, topic: &str, now: DateTime<Utc>) -> Outcome {
        // ---
        let gateway = match self.resolve_gateway(record).await {
            Ok(Some(gateway)) => gateway,
            Ok(None) => return Outcome::Ignored(IgnoreReason::GatewayNotRegistered),
            Err(e) => return Outcome::Error(e.to_string()),
        };

        let device = match self.resolve_device(record).await {
            Ok(Some(device)) => device,
            Ok(None) => return Outcome::Ignored(IgnoreReason::DeviceNotRegistered),
            Err(e) => return Outcome::Error(e.to_string()),
        };

        let reading = observation(record, &gateway, &device, now);
        let _pair = self.locks.acquire((device.id, reading.location_id)).await;

        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!(error = %e, "failed to open reconciliation transaction");
                return Outcome::Error(e.to_string());
            }
        };

        match apply(tx.as_mut(), &reading, now).await {
            Ok(outcome) => {
                let finished = match outcome {
                    Outcome::Ignored(_) => tx.rollback().await,
                    _ => tx.commit().await,
                };
                match finished {
                    Ok(()) => {
                        debug!(%outcome, pairs_in_flight = self.locks.active(), "record reconciled");
                        outcome
                    }
                    Err(e) => {
                        error!(error = %e, "failed to finish reconciliation transaction");
                        Outcome::Error(e.to_string())
                    }
                }
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                error!(error = %e, "reconciliation rolled back");
                Outcome::Error(e.to_string())
            }
        }
    }

    async fn resolve_gateway(&self, record: &NormalizedRecord) -> StoreResult<Option<Gateway>> {
        // ---
        match record.gateway_mac.as_deref().filter(|mac| !mac.is_empty()) {
            Some(mac) => self.store.find_active_gateway(&mac.to_uppercase()).await,
            None => Ok(None),
        }
    }

    async fn resolve_device(&self, record: &NormalizedRecord) -> StoreResult<Option<Device>> {
        // ---
        if record.ble_mac.is_empty() {
            return Ok(None);
        }
        self.store.find_device(&record.ble_mac.to_uppercase()).await
    }
}

/// The dedup / window decision and its writes, inside an open transaction.
async fn apply(tx: &mut dyn ReconcileTx, reading: &NewReading, now: DateTime<Utc>) -> StoreResult<Outcome> {
    // ---
    tx.lock_pair(reading.device_id, reading.location_id).await?;

    let latest = tx.latest_reading(reading.device_id, reading.location_id).await?;
    if let Some(last) = &latest {
        if millis_between(last.seen_at, now) < DEDUP_WINDOW_MS {
            return Ok(Outcome::Ignored(IgnoreReason::DuplicateSameLocationWindow));
        }
    }

    let snapshot = tx.snapshot(reading.device_id, reading.location_id).await?;
    let refresh = SnapshotUpdate::from(reading);

    if let Some(snapshot) = &snapshot {
        let diff = millis_between(snapshot.last_seen, now);

        // last_seen never moves backwards
        if diff < 0 {
            return Ok(Outcome::Skipped(SkipReason::OutOfOrder));
        }

        if diff < NO_ACTION_WINDOW_MS {
            tx.update_snapshot(snapshot.id, &refresh).await?;
            return Ok(Outcome::Skipped(SkipReason::RecentlySeen));
        }

        if diff <= COALESCE_WINDOW_MS {
            if let Some(last) = &latest {
                tx.update_reading(last.id, &ReadingUpdate::from(reading)).await?;
                tx.update_snapshot(snapshot.id, &refresh).await?;
                return Ok(Outcome::Updated(last.id));
            }
        }
    }

    let reading_id = tx.insert_reading(reading).await?;
    match &snapshot {
        Some(snapshot) => tx.update_snapshot(snapshot.id, &refresh).await?,
        None => {
            tx.insert_snapshot(&NewSnapshot::from(reading)).await?;
        }
    }

    Ok(Outcome::Inserted(reading_id))
}

fn millis_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    // ---
    (later - earlier).num_milliseconds()
}

/// Build the row values for a record seen at `now`.
fn observation(record: &NormalizedRecord, gateway: &Gateway, device: &Device, now: DateTime<Utc>) -> NewReading {
    // ---
    NewReading {
        device_id: device.id,
        gateway_id: gateway.id,
        location_id: gateway.effective_location_id,
        rssi: record.rssi,
        adv_type: record.adv_type.clone(),
        raw_data: record.raw_data.clone(),
        battery_voltage: normalize_battery_voltage(record),
        temperature: record
            .temperature
            .or_else(|| first_metric(&record.metadata, aliases::TEMPERATURE)),
        humidity: record
            .humidity
            .or_else(|| first_metric(&record.metadata, aliases::HUMIDITY)),
        status: first_present(&record.metadata, aliases::STATUS)
            .and_then(|value| value.as_str())
            .map(str::to_string),
        seen_at: now,
    }
}

/// Record battery, else a vendor battery field; coerced and rounded.
pub fn normalize_battery_voltage(record: &NormalizedRecord) -> Option<f64> {
    // ---
    match record.battery_voltage {
        Some(volts) => round_metric(volts),
        None => first_present(&record.metadata, aliases::VENDOR_BATTERY)
            .and_then(number_value)
            .and_then(round_metric),
    }
}
