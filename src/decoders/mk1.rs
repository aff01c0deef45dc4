//! MK1 gateways: a JSON array mixing one gateway entry with raw beacon
//! observations.

use serde_json::{Map, Value};
use tracing::debug;

use super::aliases;
use super::helpers::{first_integer, first_present, first_text, hex_to_bytes, number_value};
use super::helpers::{parse_timestamp, round_metric};
use super::tlm::find_tlm_frame;
use crate::models::NormalizedRecord;

// ---

pub fn decode(payload: &str) -> Vec<NormalizedRecord> {
    // ---
    let entries = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Array(entries)) => entries,
        Ok(_) => {
            debug!("MK1 payload is not a JSON array");
            return Vec::new();
        }
        Err(e) => {
            debug!(error = %e, "unable to parse MK1 payload");
            return Vec::new();
        }
    };

    let gateway_mac = entries
        .iter()
        .filter_map(Value::as_object)
        .find(|entry| entry_format(entry) == Some("Gateway"))
        .and_then(|entry| first_text(entry, aliases::MK1_GATEWAY_MAC))
        .map(|mac| mac.to_uppercase());

    entries
        .iter()
        .filter_map(Value::as_object)
        .filter(|entry| is_raw_observation(entry))
        .map(|entry| observation(entry, gateway_mac.clone()))
        .collect()
}

fn entry_format(entry: &Map<String, Value>) -> Option<&str> {
    // ---
    entry.get(aliases::FORMAT).and_then(Value::as_str)
}

fn is_raw_observation(entry: &Map<String, Value>) -> bool {
    // ---
    entry_format(entry).is_some_and(|format| format.to_lowercase().contains("raw"))
}

fn observation(entry: &Map<String, Value>, gateway_mac: Option<String>) -> NormalizedRecord {
    // ---
    let raw_data = first_text(entry, aliases::MK1_RAW_DATA);
    let tlm = raw_data
        .as_deref()
        .map(hex_to_bytes)
        .and_then(|bytes| find_tlm_frame(&bytes));

    let mut metadata = entry.clone();
    let mut battery_voltage = None;
    let mut temperature = None;

    if let Some(frame) = &tlm {
        battery_voltage = frame.battery_voltage;
        temperature = frame.temperature;
        metadata.insert("tlm".to_string(), frame.to_json());
    }

    // Gateway-reported battery wins over the beacon's own telemetry
    if let Some(vendor) = vendor_battery(entry) {
        battery_voltage = number_value(vendor).and_then(round_metric);
    }

    NormalizedRecord {
        gateway_mac,
        ble_mac: first_text(entry, aliases::MK1_BLE_MAC)
            .unwrap_or_default()
            .to_uppercase(),
        rssi: first_integer(entry, aliases::MK1_RSSI),
        adv_type: first_text(entry, aliases::MK1_ADV_TYPE),
        raw_data,
        display_name: first_text(entry, aliases::MK1_DISPLAY_NAME),
        format: entry_format(entry).map(str::to_string),
        battery_voltage,
        temperature,
        humidity: None,
        timestamp: first_present(entry, aliases::TIMESTAMP).and_then(parse_timestamp),
        metadata,
    }
}

fn vendor_battery(entry: &Map<String, Value>) -> Option<&Value> {
    // ---
    first_present(entry, aliases::VENDOR_BATTERY)
        .filter(|value| !matches!(value, Value::String(s) if s.is_empty()))
}
