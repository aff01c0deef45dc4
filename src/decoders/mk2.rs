//! MK2 gateways: a loose envelope that may be a JSON object, a JSON array,
//! or base64-wrapped JSON, with many historical field spellings.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::aliases;
use super::helpers::{first_integer, first_metric, first_present, first_text, hex_to_bytes};
use super::helpers::parse_timestamp;
use crate::models::NormalizedRecord;

// ---

pub fn decode(payload: &str) -> Vec<NormalizedRecord> {
    // ---
    unwrap_envelope(payload)
        .iter()
        .filter_map(Value::as_object)
        .map(normalize)
        .collect()
}

/// Peel the envelope down to a list of candidate objects.
fn unwrap_envelope(payload: &str) -> Vec<Value> {
    // ---
    let content = serde_json::from_str::<Value>(payload)
        .ok()
        .or_else(|| from_base64(payload));

    match content {
        Some(Value::Array(items)) => items,
        Some(object @ Value::Object(_)) => vec![object],
        _ => {
            debug!("MK2 payload is neither JSON nor base64 JSON, keeping raw bytes");
            vec![json!({ "rawBytes": hex_to_bytes(payload) })]
        }
    }
}

/// Standard or URL-safe alphabet, padded or not, line breaks allowed.
fn from_base64(payload: &str) -> Option<Value> {
    // ---
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(&compact).ok())?;
    let text = String::from_utf8(bytes).ok()?;
    serde_json::from_str(&text).ok()
}

fn normalize(record: &Map<String, Value>) -> NormalizedRecord {
    // ---
    NormalizedRecord {
        gateway_mac: first_text(record, aliases::GATEWAY_MAC).map(|mac| mac.to_uppercase()),
        ble_mac: first_text(record, aliases::BLE_MAC)
            .unwrap_or_default()
            .to_uppercase(),
        rssi: first_integer(record, aliases::RSSI),
        adv_type: first_text(record, aliases::ADV_TYPE),
        raw_data: first_text(record, aliases::RAW_DATA),
        display_name: first_text(record, aliases::DISPLAY_NAME),
        format: first_text(record, &[aliases::FORMAT]),
        battery_voltage: first_metric(record, aliases::BATTERY_VOLTAGE),
        temperature: first_metric(record, aliases::TEMPERATURE),
        humidity: first_metric(record, aliases::HUMIDITY),
        timestamp: first_present(record, aliases::TIMESTAMP).and_then(parse_timestamp),
        metadata: record.clone(),
    }
}
