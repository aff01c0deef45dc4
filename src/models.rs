//! Data models for the gateway telemetry pipeline.
//!
//! `NormalizedRecord` is what the frame decoders emit; everything else mirrors
//! the rows the reconciliation engine and alarm sweep read and write.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

// ---

/// One device observation decoded from a gateway payload.
///
/// Produced fresh for every decode call and never mutated afterwards. MACs
/// are upper-cased; numeric fields that were absent or unparseable are `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRecord {
    // ---
    pub gateway_mac: Option<String>,
    pub ble_mac: String,
    pub rssi: Option<i32>,
    pub adv_type: Option<String>,
    pub raw_data: Option<String>,
    pub display_name: Option<String>,
    pub format: Option<String>,
    /// Volts, rounded to 3 decimals.
    pub battery_voltage: Option<f64>,
    /// Degrees Celsius.
    pub temperature: Option<f64>,
    /// Relative humidity, percent.
    pub humidity: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    /// The protocol entry the record was built from, plus decoder extras.
    pub metadata: Map<String, Value>,
}

/// An active gateway with its effective location already resolved.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Gateway {
    // ---
    pub id: Uuid,
    pub mac: String,
    pub name: Option<String>,
    pub is_active: bool,
    /// Explicit location, else the most recent location assignment.
    pub effective_location_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Device {
    // ---
    pub id: Uuid,
    pub ble_mac: String,
    pub name: Option<String>,
}

/// One historical observation row.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Reading {
    // ---
    pub id: Uuid,
    pub device_id: Uuid,
    pub gateway_id: Uuid,
    pub location_id: Option<Uuid>,
    pub rssi: Option<i32>,
    pub adv_type: Option<String>,
    pub raw_data: Option<String>,
    pub battery_voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub status: Option<String>,
    pub seen_at: DateTime<Utc>,
}

/// Column values for a reading about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    // ---
    pub device_id: Uuid,
    pub gateway_id: Uuid,
    pub location_id: Option<Uuid>,
    pub rssi: Option<i32>,
    pub adv_type: Option<String>,
    pub raw_data: Option<String>,
    pub battery_voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub status: Option<String>,
    pub seen_at: DateTime<Utc>,
}

/// Partial update of a reading row.
///
/// `None` leaves a column untouched; `Some(None)` writes NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingUpdate {
    // ---
    pub gateway_id: Option<Uuid>,
    pub location_id: Option<Option<Uuid>>,
    pub rssi: Option<Option<i32>>,
    pub adv_type: Option<Option<String>>,
    pub raw_data: Option<Option<String>>,
    pub battery_voltage: Option<Option<f64>>,
    pub temperature: Option<Option<f64>>,
    pub humidity: Option<Option<f64>>,
    pub status: Option<Option<String>>,
    pub seen_at: Option<DateTime<Utc>>,
}

/// Latest known state of a device at one location.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Snapshot {
    // ---
    pub id: Uuid,
    pub device_id: Uuid,
    pub location_id: Option<Uuid>,
    pub gateway_id: Option<Uuid>,
    pub last_seen: DateTime<Utc>,
    pub status: Option<String>,
    pub battery_voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshot {
    // ---
    pub device_id: Uuid,
    pub location_id: Option<Uuid>,
    pub gateway_id: Option<Uuid>,
    pub last_seen: DateTime<Utc>,
    pub status: Option<String>,
    pub battery_voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

/// Partial update of a snapshot row, same conventions as [`ReadingUpdate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotUpdate {
    // ---
    pub gateway_id: Option<Option<Uuid>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: Option<Option<String>>,
    pub battery_voltage: Option<Option<f64>>,
    pub temperature: Option<Option<f64>>,
    pub humidity: Option<Option<f64>>,
}

/// A reading joined with the names of the gateway and location it came from.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct HistoryEntry {
    // ---
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub reading: Reading,
    pub gateway_name: Option<String>,
    pub location_name: Option<String>,
}

/// A device's snapshot at one location, as listed in [`LocationGroup`].
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DeviceState {
    // ---
    /// Device id.
    pub id: Uuid,
    pub name: Option<String>,
    pub ble_mac: String,
    pub last_seen: DateTime<Utc>,
    pub battery_voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub status: Option<String>,
}

/// Snapshot row tagged with its location, before grouping.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct LocatedDeviceState {
    // ---
    pub location_id: Option<Uuid>,
    pub location_name: Option<String>,
    #[sqlx(flatten)]
    pub device: DeviceState,
}

/// Every device snapshot at one location, most recently seen first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationGroup {
    // ---
    /// `None` collects snapshots taken while the gateway had no location.
    pub location_id: Option<Uuid>,
    pub location_name: Option<String>,
    pub devices: Vec<DeviceState>,
}

impl LocationGroup {
    /// Fold rows already ordered by location into one group per location.
    pub fn group(rows: impl IntoIterator<Item = LocatedDeviceState>) -> Vec<LocationGroup> {
        // ---
        let mut groups: Vec<LocationGroup> = Vec::new();
        for row in rows {
            if let Some(group) = groups.last_mut().filter(|g| g.location_id == row.location_id) {
                group.devices.push(row.device);
                continue;
            }
            groups.push(LocationGroup {
                location_id: row.location_id,
                location_name: row.location_name,
                devices: vec![row.device],
            });
        }
        groups
    }
}

/// One (active alarm, monitored device) pair.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AlarmAssignment {
    // ---
    pub alarm_id: Uuid,
    pub alarm_name: String,
    pub threshold_seconds: i64,
    pub device_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmEventStatus {
    Triggered,
    Resolved,
}

impl AlarmEventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmEventStatus::Triggered => "triggered",
            AlarmEventStatus::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmEvent {
    // ---
    pub id: Uuid,
    pub alarm_id: Uuid,
    pub device_id: Uuid,
    pub status: AlarmEventStatus,
    pub triggered_at: DateTime<Utc>,
}

/// Audit row for an inbound message, stored before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    // ---
    pub topic: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

// ---

impl From<&NewReading> for ReadingUpdate {
    fn from(reading: &NewReading) -> Self {
        // ---
        ReadingUpdate {
            gateway_id: Some(reading.gateway_id),
            location_id: Some(reading.location_id),
            rssi: Some(reading.rssi),
            adv_type: Some(reading.adv_type.clone()),
            raw_data: Some(reading.raw_data.clone()),
            battery_voltage: Some(reading.battery_voltage),
            temperature: Some(reading.temperature),
            humidity: Some(reading.humidity),
            status: Some(reading.status.clone()),
            seen_at: Some(reading.seen_at),
        }
    }
}

impl From<&NewReading> for SnapshotUpdate {
    /// The volatile snapshot fields refreshed on every accepted observation.
    fn from(reading: &NewReading) -> Self {
        // ---
        SnapshotUpdate {
            gateway_id: Some(Some(reading.gateway_id)),
            last_seen: Some(reading.seen_at),
            status: Some(reading.status.clone()),
            battery_voltage: Some(reading.battery_voltage),
            temperature: Some(reading.temperature),
            humidity: Some(reading.humidity),
        }
    }
}

impl From<&NewReading> for NewSnapshot {
    fn from(reading: &NewReading) -> Self {
        // ---
        NewSnapshot {
            device_id: reading.device_id,
            location_id: reading.location_id,
            gateway_id: Some(reading.gateway_id),
            last_seen: reading.seen_at,
            status: reading.status.clone(),
            battery_voltage: reading.battery_voltage,
            temperature: reading.temperature,
            humidity: reading.humidity,
        }
    }
}

impl ReadingUpdate {
    /// Apply the set fields onto an existing row.
    pub fn apply_to(&self, reading: &mut Reading) {
        // ---
        if let Some(v) = self.gateway_id {
            reading.gateway_id = v;
        }
        if let Some(v) = self.location_id {
            reading.location_id = v;
        }
        if let Some(v) = self.rssi {
            reading.rssi = v;
        }
        if let Some(v) = &self.adv_type {
            reading.adv_type = v.clone();
        }
        if let Some(v) = &self.raw_data {
            reading.raw_data = v.clone();
        }
        if let Some(v) = self.battery_voltage {
            reading.battery_voltage = v;
        }
        if let Some(v) = self.temperature {
            reading.temperature = v;
        }
        if let Some(v) = self.humidity {
            reading.humidity = v;
        }
        if let Some(v) = &self.status {
            reading.status = v.clone();
        }
        if let Some(v) = self.seen_at {
            reading.seen_at = v;
        }
    }
}

impl SnapshotUpdate {
    pub fn apply_to(&self, snapshot: &mut Snapshot) {
        // ---
        if let Some(v) = self.gateway_id {
            snapshot.gateway_id = v;
        }
        if let Some(v) = self.last_seen {
            snapshot.last_seen = v;
        }
        if let Some(v) = &self.status {
            snapshot.status = v.clone();
        }
        if let Some(v) = self.battery_voltage {
            snapshot.battery_voltage = v;
        }
        if let Some(v) = self.temperature {
            snapshot.temperature = v;
        }
        if let Some(v) = self.humidity {
            snapshot.humidity = v;
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn create_test_reading() -> Reading {
        // ---
        Reading {
            id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            gateway_id: Uuid::new_v4(),
            location_id: None,
            rssi: Some(-70),
            adv_type: Some("Legacy".to_string()),
            raw_data: None,
            battery_voltage: Some(3.0),
            temperature: Some(21.5),
            humidity: None,
            status: Some("ok".to_string()),
            seen_at: Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap(),
        }
    }

    #[test]
    fn test_unset_fields_are_left_alone() {
        // ---
        let mut reading = create_test_reading();
        let before = reading.clone();

        ReadingUpdate::default().apply_to(&mut reading);

        assert_eq!(reading, before);
    }

    #[test]
    fn test_set_null_clears_column() {
        // ---
        let mut reading = create_test_reading();
        let update = ReadingUpdate {
            battery_voltage: Some(None),
            status: Some(None),
            ..Default::default()
        };

        update.apply_to(&mut reading);

        assert_eq!(reading.battery_voltage, None);
        assert_eq!(reading.status, None);
        // Untouched columns survive
        assert_eq!(reading.temperature, Some(21.5));
        assert_eq!(reading.rssi, Some(-70));
    }

    #[test]
    fn test_snapshot_refresh_from_new_reading() {
        // ---
        let seen_at = Utc.with_ymd_and_hms(2025, 3, 26, 19, 0, 0).unwrap();
        let gateway_id = Uuid::new_v4();
        let reading = NewReading {
            device_id: Uuid::new_v4(),
            gateway_id,
            location_id: Some(Uuid::new_v4()),
            rssi: Some(-60),
            adv_type: None,
            raw_data: None,
            battery_voltage: Some(3.1),
            temperature: None,
            humidity: Some(40.0),
            status: None,
            seen_at,
        };
        let mut snapshot = Snapshot {
            id: Uuid::new_v4(),
            device_id: reading.device_id,
            location_id: reading.location_id,
            gateway_id: None,
            last_seen: Utc.with_ymd_and_hms(2025, 3, 26, 18, 0, 0).unwrap(),
            status: Some("stale".to_string()),
            battery_voltage: Some(2.9),
            temperature: Some(20.0),
            humidity: None,
        };

        SnapshotUpdate::from(&reading).apply_to(&mut snapshot);

        assert_eq!(snapshot.gateway_id, Some(gateway_id));
        assert_eq!(snapshot.last_seen, seen_at);
        assert_eq!(snapshot.status, None);
        assert_eq!(snapshot.battery_voltage, Some(3.1));
        assert_eq!(snapshot.temperature, None);
        assert_eq!(snapshot.humidity, Some(40.0));
    }

    fn located(location_id: Option<Uuid>, ble_mac: &str) -> LocatedDeviceState {
        // ---
        LocatedDeviceState {
            location_id,
            location_name: location_id.map(|_| "Cold room".to_string()),
            device: DeviceState {
                id: Uuid::new_v4(),
                name: None,
                ble_mac: ble_mac.to_string(),
                last_seen: Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap(),
                battery_voltage: None,
                temperature: None,
                humidity: None,
                status: None,
            },
        }
    }

    #[test]
    fn test_group_folds_adjacent_rows_by_location() {
        // ---
        let site = Some(Uuid::new_v4());
        let rows = vec![located(site, "AA:01"), located(site, "AA:02"), located(None, "AA:03")];

        let groups = LocationGroup::group(rows);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].location_id, site);
        assert_eq!(groups[0].location_name.as_deref(), Some("Cold room"));
        let macs: Vec<_> = groups[0].devices.iter().map(|d| d.ble_mac.as_str()).collect();
        assert_eq!(macs, vec!["AA:01", "AA:02"]);
        assert_eq!(groups[1].location_id, None);
        assert_eq!(groups[1].devices.len(), 1);
        assert!(LocationGroup::group(Vec::new()).is_empty());
    }

    #[test]
    fn test_history_entry_serializes_flat() {
        // ---
        let entry = HistoryEntry {
            reading: create_test_reading(),
            gateway_name: Some("dock".to_string()),
            location_name: None,
        };

        let body = serde_json::to_value(&entry).unwrap();

        assert_eq!(body["rssi"], -70);
        assert_eq!(body["gateway_name"], "dock");
        assert!(body["location_name"].is_null());
        assert!(body.get("reading").is_none());
    }

    #[test]
    fn test_alarm_event_status_names() {
        // ---
        assert_eq!(AlarmEventStatus::Triggered.as_str(), "triggered");
        assert_eq!(AlarmEventStatus::Resolved.as_str(), "resolved");
    }
}
