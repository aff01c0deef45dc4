//! In-process store with the same semantics as the PostgreSQL tables.
//!
//! A transaction takes the whole state lock, works on a staged copy and
//! swaps it in on commit, so every transaction is fully serialized.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{ReconcileTx, StoreError, StoreResult, TelemetryStore};
use crate::models::{
    AlarmAssignment, AlarmEvent, AlarmEventStatus, Device, DeviceState, Gateway, HistoryEntry,
    LocatedDeviceState, LocationGroup, NewReading, NewSnapshot, RawMessage, Reading,
    ReadingUpdate, Snapshot, SnapshotUpdate,
};

// ---

#[derive(Debug, Clone)]
struct LocationRow {
    id: Uuid,
    name: String,
}

#[derive(Debug, Clone)]
struct GatewayRow {
    id: Uuid,
    mac: String,
    name: Option<String>,
    is_active: bool,
    location_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct LocationAssignment {
    gateway_id: Uuid,
    location_id: Uuid,
    assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct AlarmRow {
    id: Uuid,
    name: String,
    threshold_seconds: i64,
    is_active: bool,
    device_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    locations: Vec<LocationRow>,
    gateways: Vec<GatewayRow>,
    gateway_locations: Vec<LocationAssignment>,
    devices: Vec<Device>,
    readings: Vec<Reading>,
    snapshots: Vec<Snapshot>,
    alarms: Vec<AlarmRow>,
    alarm_events: Vec<AlarmEvent>,
    messages: Vec<RawMessage>,
}

impl MemoryState {
    fn effective_location(&self, gateway: &GatewayRow) -> Option<Uuid> {
        // ---
        gateway.location_id.or_else(|| {
            self.gateway_locations
                .iter()
                .filter(|a| a.gateway_id == gateway.id)
                .max_by_key(|a| a.assigned_at)
                .map(|a| a.location_id)
        })
    }

    fn location_name(&self, id: Option<Uuid>) -> Option<String> {
        // ---
        let id = id?;
        self.locations.iter().find(|l| l.id == id).map(|l| l.name.clone())
    }

    fn gateway_name(&self, id: Uuid) -> Option<String> {
        self.gateways.iter().find(|g| g.id == id).and_then(|g| g.name.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_writes: Arc<AtomicBool>,
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_location(&self, name: &str) -> Uuid {
        // ---
        let id = Uuid::new_v4();
        self.state.lock().await.locations.push(LocationRow {
            id,
            name: name.to_string(),
        });
        id
    }

    /// Register a gateway; `location_id` is its explicit location.
    pub async fn add_gateway(&self, mac: &str, location_id: Option<Uuid>, is_active: bool) -> Uuid {
        // ---
        let id = Uuid::new_v4();
        self.state.lock().await.gateways.push(GatewayRow {
            id,
            mac: mac.to_uppercase(),
            name: None,
            is_active,
            location_id,
        });
        id
    }

    pub async fn set_gateway_name(&self, gateway_id: Uuid, name: &str) {
        // ---
        let mut state = self.state.lock().await;
        if let Some(gateway) = state.gateways.iter_mut().find(|g| g.id == gateway_id) {
            gateway.name = Some(name.to_string());
        }
    }

    /// Record a location assignment history entry for a gateway.
    pub async fn assign_gateway_location(
        &self,
        gateway_id: Uuid,
        location_id: Uuid,
        assigned_at: DateTime<Utc>,
    ) {
        // ---
        self.state
            .lock()
            .await
            .gateway_locations
            .push(LocationAssignment {
                gateway_id,
                location_id,
                assigned_at,
            });
    }

    pub async fn add_device(&self, ble_mac: &str) -> Uuid {
        // ---
        let id = Uuid::new_v4();
        self.state.lock().await.devices.push(Device {
            id,
            ble_mac: ble_mac.to_uppercase(),
            name: None,
        });
        id
    }

    pub async fn add_alarm(
        &self,
        name: &str,
        threshold_seconds: i64,
        device_ids: &[Uuid],
        is_active: bool,
    ) -> Uuid {
        // ---
        let id = Uuid::new_v4();
        self.state.lock().await.alarms.push(AlarmRow {
            id,
            name: name.to_string(),
            threshold_seconds,
            is_active,
            device_ids: device_ids.to_vec(),
        });
        id
    }

    /// Close every open event of (alarm, device), as an operator would.
    pub async fn resolve_alarm_events(&self, alarm_id: Uuid, device_id: Uuid) {
        // ---
        let mut state = self.state.lock().await;
        for event in state
            .alarm_events
            .iter_mut()
            .filter(|e| e.alarm_id == alarm_id && e.device_id == device_id)
        {
            event.status = AlarmEventStatus::Resolved;
        }
    }

    /// Make every subsequent transactional write fail, for rollback tests.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn readings(&self) -> Vec<Reading> {
        self.state.lock().await.readings.clone()
    }

    pub async fn snapshots(&self) -> Vec<Snapshot> {
        self.state.lock().await.snapshots.clone()
    }

    pub async fn alarm_events(&self) -> Vec<AlarmEvent> {
        self.state.lock().await.alarm_events.clone()
    }

    pub async fn messages(&self) -> Vec<RawMessage> {
        self.state.lock().await.messages.clone()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn record_message(&self, topic: &str, payload: &Value) -> StoreResult<()> {
        // ---
        self.state.lock().await.messages.push(RawMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
            received_at: Utc::now(),
        });
        Ok(())
    }

    async fn find_active_gateway(&self, mac: &str) -> StoreResult<Option<Gateway>> {
        // ---
        let state = self.state.lock().await;
        let gateway = state
            .gateways
            .iter()
            .find(|g| g.mac == mac && g.is_active)
            .map(|g| Gateway {
                id: g.id,
                mac: g.mac.clone(),
                name: g.name.clone(),
                is_active: g.is_active,
                effective_location_id: state.effective_location(g),
            });
        Ok(gateway)
    }

    async fn find_device(&self, ble_mac: &str) -> StoreResult<Option<Device>> {
        // ---
        let state = self.state.lock().await;
        Ok(state.devices.iter().find(|d| d.ble_mac == ble_mac).cloned())
    }

    async fn begin(&self) -> StoreResult<Box<dyn ReconcileTx>> {
        // ---
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            staged,
            fail_writes: self.fail_writes.load(Ordering::SeqCst),
        }))
    }

    async fn alarm_assignments(&self) -> StoreResult<Vec<AlarmAssignment>> {
        // ---
        let state = self.state.lock().await;
        let assignments = state
            .alarms
            .iter()
            .filter(|a| a.is_active)
            .flat_map(|a| {
                a.device_ids.iter().map(|device_id| AlarmAssignment {
                    alarm_id: a.id,
                    alarm_name: a.name.clone(),
                    threshold_seconds: a.threshold_seconds,
                    device_id: *device_id,
                })
            })
            .collect();
        Ok(assignments)
    }

    async fn latest_last_seen(&self, device_id: Uuid) -> StoreResult<Option<DateTime<Utc>>> {
        // ---
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.device_id == device_id)
            .map(|s| s.last_seen)
            .max())
    }

    async fn open_alarm_event(
        &self,
        alarm_id: Uuid,
        device_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        // ---
        let mut state = self.state.lock().await;
        let already_open = state.alarm_events.iter().any(|e| {
            e.alarm_id == alarm_id
                && e.device_id == device_id
                && e.status == AlarmEventStatus::Triggered
        });
        if already_open {
            return Ok(false);
        }
        state.alarm_events.push(AlarmEvent {
            id: Uuid::new_v4(),
            alarm_id,
            device_id,
            status: AlarmEventStatus::Triggered,
            triggered_at: at,
        });
        Ok(true)
    }

    async fn devices_by_location(&self) -> StoreResult<Vec<LocationGroup>> {
        // ---
        let state = self.state.lock().await;
        let mut rows: Vec<LocatedDeviceState> = state
            .snapshots
            .iter()
            .filter_map(|s| {
                let device = state.devices.iter().find(|d| d.id == s.device_id)?;
                Some(LocatedDeviceState {
                    location_id: s.location_id,
                    location_name: state.location_name(s.location_id),
                    device: DeviceState {
                        id: device.id,
                        name: device.name.clone(),
                        ble_mac: device.ble_mac.clone(),
                        last_seen: s.last_seen,
                        battery_voltage: s.battery_voltage,
                        temperature: s.temperature,
                        humidity: s.humidity,
                        status: s.status.clone(),
                    },
                })
            })
            .collect();

        rows.sort_by_key(|r| {
            (
                r.location_name.is_none(),
                r.location_name.clone(),
                r.location_id.is_none(),
                r.location_id,
                Reverse(r.device.last_seen),
            )
        });
        Ok(LocationGroup::group(rows))
    }

    async fn device_history(&self, device_id: Uuid, limit: i64) -> StoreResult<Vec<HistoryEntry>> {
        // ---
        let state = self.state.lock().await;
        let mut readings: Vec<&Reading> =
            state.readings.iter().filter(|r| r.device_id == device_id).collect();
        readings.sort_by_key(|r| Reverse(r.seen_at));

        Ok(readings
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|r| HistoryEntry {
                reading: r.clone(),
                gateway_name: state.gateway_name(r.gateway_id),
                location_name: state.location_name(r.location_id),
            })
            .collect())
    }
}

impl MemoryTx {
    fn check_writable(&self) -> StoreResult<()> {
        // ---
        if self.fail_writes {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReconcileTx for MemoryTx {
    async fn lock_pair(&mut self, _device_id: Uuid, _location_id: Option<Uuid>) -> StoreResult<()> {
        // The state lock already serializes every transaction
        Ok(())
    }

    async fn latest_reading(
        &mut self,
        device_id: Uuid,
        location_id: Option<Uuid>,
    ) -> StoreResult<Option<Reading>> {
        // ---
        Ok(self
            .staged
            .readings
            .iter()
            .filter(|r| r.device_id == device_id && r.location_id == location_id)
            .max_by_key(|r| r.seen_at)
            .cloned())
    }

    async fn snapshot(
        &mut self,
        device_id: Uuid,
        location_id: Option<Uuid>,
    ) -> StoreResult<Option<Snapshot>> {
        // ---
        Ok(self
            .staged
            .snapshots
            .iter()
            .find(|s| s.device_id == device_id && s.location_id == location_id)
            .cloned())
    }

    async fn insert_reading(&mut self, reading: &NewReading) -> StoreResult<Uuid> {
        // ---
        self.check_writable()?;
        let id = Uuid::new_v4();
        self.staged.readings.push(Reading {
            id,
            device_id: reading.device_id,
            gateway_id: reading.gateway_id,
            location_id: reading.location_id,
            rssi: reading.rssi,
            adv_type: reading.adv_type.clone(),
            raw_data: reading.raw_data.clone(),
            battery_voltage: reading.battery_voltage,
            temperature: reading.temperature,
            humidity: reading.humidity,
            status: reading.status.clone(),
            seen_at: reading.seen_at,
        });
        Ok(id)
    }

    async fn update_reading(&mut self, id: Uuid, update: &ReadingUpdate) -> StoreResult<()> {
        // ---
        self.check_writable()?;
        let reading = self
            .staged
            .readings
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound {
                entity: "reading",
                id,
            })?;
        update.apply_to(reading);
        Ok(())
    }

    async fn insert_snapshot(&mut self, snapshot: &NewSnapshot) -> StoreResult<Uuid> {
        // ---
        self.check_writable()?;
        let duplicate = self
            .staged
            .snapshots
            .iter()
            .any(|s| s.device_id == snapshot.device_id && s.location_id == snapshot.location_id);
        if duplicate {
            return Err(StoreError::Unavailable(format!(
                "snapshot already exists for device {}",
                snapshot.device_id
            )));
        }

        let id = Uuid::new_v4();
        self.staged.snapshots.push(Snapshot {
            id,
            device_id: snapshot.device_id,
            location_id: snapshot.location_id,
            gateway_id: snapshot.gateway_id,
            last_seen: snapshot.last_seen,
            status: snapshot.status.clone(),
            battery_voltage: snapshot.battery_voltage,
            temperature: snapshot.temperature,
            humidity: snapshot.humidity,
        });
        Ok(id)
    }

    async fn update_snapshot(&mut self, id: Uuid, update: &SnapshotUpdate) -> StoreResult<()> {
        // ---
        self.check_writable()?;
        let snapshot = self
            .staged
            .snapshots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::NotFound {
                entity: "snapshot",
                id,
            })?;
        update.apply_to(snapshot);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        // ---
        let MemoryTx {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, TimeZone};

    fn new_reading(device_id: Uuid, gateway_id: Uuid, seen_at: DateTime<Utc>) -> NewReading {
        // ---
        NewReading {
            device_id,
            gateway_id,
            location_id: None,
            rssi: None,
            adv_type: None,
            raw_data: None,
            battery_voltage: None,
            temperature: None,
            humidity: None,
            status: None,
            seen_at,
        }
    }

    #[tokio::test]
    async fn test_effective_location_prefers_explicit_then_latest_assignment() {
        // ---
        let store = MemoryStore::new();
        let explicit = Uuid::new_v4();
        let older = Uuid::new_v4();
        let newer = Uuid::new_v4();
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        store.add_gateway("aa:00", Some(explicit), true).await;
        let floating = store.add_gateway("aa:01", None, true).await;
        store.assign_gateway_location(floating, newer, t0 + Duration::days(1)).await;
        store.assign_gateway_location(floating, older, t0).await;

        let g = store.find_active_gateway("AA:00").await.unwrap().unwrap();
        assert_eq!(g.effective_location_id, Some(explicit));

        let g = store.find_active_gateway("AA:01").await.unwrap().unwrap();
        assert_eq!(g.effective_location_id, Some(newer));
    }

    #[tokio::test]
    async fn test_inactive_gateway_is_invisible() {
        // ---
        let store = MemoryStore::new();
        store.add_gateway("aa:02", None, false).await;

        assert!(store.find_active_gateway("AA:02").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        // ---
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        tx.insert_reading(&new_reading(Uuid::new_v4(), Uuid::new_v4(), now))
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert!(store.readings().await.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.insert_reading(&new_reading(Uuid::new_v4(), Uuid::new_v4(), now))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.readings().await.len(), 1);
    }

    fn snapshot_row(device_id: Uuid, location_id: Option<Uuid>, last_seen: DateTime<Utc>) -> NewSnapshot {
        // ---
        NewSnapshot {
            device_id,
            location_id,
            gateway_id: None,
            last_seen,
            status: None,
            battery_voltage: Some(3.0),
            temperature: None,
            humidity: None,
        }
    }

    #[tokio::test]
    async fn test_devices_grouped_by_location_name() {
        // ---
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();
        let warehouse = store.add_location("Warehouse").await;
        let lab = store.add_location("Lab").await;
        let (a, b) = (store.add_device("aa:01").await, store.add_device("aa:02").await);

        let mut tx = store.begin().await.unwrap();
        tx.insert_snapshot(&snapshot_row(a, Some(warehouse), t0)).await.unwrap();
        tx.insert_snapshot(&snapshot_row(b, Some(warehouse), t0 + Duration::minutes(1)))
            .await
            .unwrap();
        tx.insert_snapshot(&snapshot_row(a, None, t0)).await.unwrap();
        tx.insert_snapshot(&snapshot_row(b, Some(lab), t0)).await.unwrap();
        tx.commit().await.unwrap();

        let groups = store.devices_by_location().await.unwrap();

        let names: Vec<_> = groups.iter().map(|g| g.location_name.as_deref()).collect();
        assert_eq!(names, vec![Some("Lab"), Some("Warehouse"), None]);
        let warehouse_macs: Vec<_> = groups[1].devices.iter().map(|d| d.ble_mac.as_str()).collect();
        assert_eq!(warehouse_macs, vec!["AA:02", "AA:01"]);
        assert_eq!(groups[2].location_id, None);
        assert_eq!(groups[2].devices[0].id, a);
        assert_eq!(groups[2].devices[0].battery_voltage, Some(3.0));
    }

    #[tokio::test]
    async fn test_device_history_newest_first_with_names() {
        // ---
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();
        let dock = store.add_location("Dock").await;
        let gateway = store.add_gateway("aa:00", Some(dock), true).await;
        store.set_gateway_name(gateway, "dock-gw").await;
        let device = store.add_device("aa:01").await;

        let mut tx = store.begin().await.unwrap();
        for minute in [0, 20, 10] {
            let mut reading = new_reading(device, gateway, t0 + Duration::minutes(minute));
            reading.location_id = Some(dock);
            tx.insert_reading(&reading).await.unwrap();
        }
        tx.insert_reading(&new_reading(Uuid::new_v4(), gateway, t0)).await.unwrap();
        tx.commit().await.unwrap();

        let history = store.device_history(device, 2).await.unwrap();

        let seen: Vec<_> = history.iter().map(|h| h.reading.seen_at).collect();
        assert_eq!(seen, vec![t0 + Duration::minutes(20), t0 + Duration::minutes(10)]);
        assert_eq!(history[0].gateway_name.as_deref(), Some("dock-gw"));
        assert_eq!(history[0].location_name.as_deref(), Some("Dock"));
        assert_eq!(store.device_history(device, 500).await.unwrap().len(), 3);
        assert!(store.device_history(Uuid::new_v4(), 500).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_alarm_event_is_conflict_free() {
        // ---
        let store = MemoryStore::new();
        let (alarm, device) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();

        assert!(store.open_alarm_event(alarm, device, now).await.unwrap());
        assert!(!store.open_alarm_event(alarm, device, now).await.unwrap());
        assert!(store.open_alarm_event(alarm, Uuid::new_v4(), now).await.unwrap());
        assert_eq!(store.alarm_events().await.len(), 2);

        // A resolved event no longer blocks a new one
        store.resolve_alarm_events(alarm, device).await;
        assert!(store.open_alarm_event(alarm, device, now).await.unwrap());

        let statuses: Vec<_> = store
            .alarm_events()
            .await
            .into_iter()
            .filter(|e| e.device_id == device)
            .map(|e| e.status.as_str())
            .collect();
        assert_eq!(statuses, vec!["resolved", "triggered"]);
    }
}
