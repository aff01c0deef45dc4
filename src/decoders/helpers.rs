//! Field coercion shared by all protocol decoders.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

// ---

/// Decode a hex string, ignoring whitespace and a trailing odd nibble.
///
/// Text that is not hex at all decodes to no bytes.
pub fn hex_to_bytes(hex: &str) -> Vec<u8> {
    // ---
    let mut clean: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if clean.len() % 2 == 1 {
        clean.pop();
    }
    hex::decode(&clean).unwrap_or_default()
}

/// Reinterpret one byte as a two's-complement signed integer.
pub fn sign_extend_byte(byte: u8) -> i8 {
    // ---
    i8::from_be_bytes([byte])
}

/// Round a metric to 3 decimal places; non-finite values become `None`.
pub fn round_metric(value: f64) -> Option<f64> {
    // ---
    if !value.is_finite() {
        return None;
    }
    Some((value * 1000.0).round() / 1000.0)
}

/// Coerce a JSON number or numeric string.
pub fn number_value(value: &Value) -> Option<f64> {
    // ---
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// Coerce a JSON value to non-empty text.
pub fn text_value(value: &Value) -> Option<String> {
    // ---
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-null value among `aliases`, in order.
pub fn first_present<'a>(entry: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    // ---
    aliases
        .iter()
        .filter_map(|key| entry.get(*key))
        .find(|value| !value.is_null())
}

/// First alias that yields non-empty text.
pub fn first_text(entry: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    // ---
    aliases
        .iter()
        .filter_map(|key| entry.get(*key))
        .find_map(text_value)
}

/// First alias holding a number, coerced and rounded to 3 decimals.
pub fn first_metric(entry: &Map<String, Value>, aliases: &[&str]) -> Option<f64> {
    // ---
    first_present(entry, aliases)
        .and_then(number_value)
        .and_then(round_metric)
}

/// First alias holding an integer-valued number (e.g. RSSI).
pub fn first_integer(entry: &Map<String, Value>, aliases: &[&str]) -> Option<i32> {
    // ---
    first_present(entry, aliases)
        .and_then(number_value)
        .filter(|n| *n >= f64::from(i32::MIN) && *n <= f64::from(i32::MAX))
        .map(|n| n.round() as i32)
}

/// Parse a gateway timestamp.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]` taken as UTC, and epoch
/// milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    // ---
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|naive| naive.and_utc())
        }
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
