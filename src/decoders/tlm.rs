//! Eddystone TLM frames embedded in raw BLE advertisements.

use serde_json::{json, Value};

use super::helpers::{round_metric, sign_extend_byte};

// ---

/// Service UUID 0xFEAA (little-endian on air) followed by frame type 0x20.
pub const TLM_MAGIC: [u8; 3] = [0xAA, 0xFE, 0x20];

/// Magic plus version, battery, temperature, advertisement and uptime counters.
const TLM_FRAME_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct TlmFrame {
    // ---
    pub version: u8,
    pub battery_voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub adv_count: u32,
    pub sec_count: u32,
}

impl TlmFrame {
    /// Metadata form stored next to the decoded record.
    pub fn to_json(&self) -> Value {
        // ---
        json!({
            "frame": "eddystone-tlm",
            "version": self.version,
            "batteryVoltage": self.battery_voltage,
            "temperature": self.temperature,
            "advCount": self.adv_count,
            "secCount": self.sec_count,
        })
    }
}

/// Scan an advertisement for the first complete TLM frame.
pub fn find_tlm_frame(bytes: &[u8]) -> Option<TlmFrame> {
    // ---
    bytes
        .windows(TLM_FRAME_LEN)
        .find(|window| window.starts_with(&TLM_MAGIC))
        .map(parse_frame)
}

fn parse_frame(frame: &[u8]) -> TlmFrame {
    // ---
    let battery_mv = u16::from_be_bytes([frame[4], frame[5]]);
    let temperature = f64::from(sign_extend_byte(frame[6])) + f64::from(frame[7]) / 256.0;

    TlmFrame {
        version: frame[3],
        battery_voltage: round_metric(f64::from(battery_mv) / 1000.0),
        temperature: round_metric(temperature),
        adv_count: u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]),
        sec_count: u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn frame(battery: [u8; 2], temp: [u8; 2]) -> Vec<u8> {
        // ---
        let mut bytes = TLM_MAGIC.to_vec();
        bytes.push(0x00);
        bytes.extend_from_slice(&battery);
        bytes.extend_from_slice(&temp);
        bytes.extend_from_slice(&[0x00, 0x00, 0x01, 0x00]);
        bytes.extend_from_slice(&[0x80, 0x00, 0x00, 0x01]);
        bytes
    }

    #[test]
    fn test_battery_and_temperature_big_endian() {
        // ---
        let tlm = find_tlm_frame(&frame([0x0C, 0x1C], [0xFE, 0x80])).unwrap();

        assert_eq!(tlm.version, 0);
        assert_eq!(tlm.battery_voltage, Some(3.1));
        assert_eq!(tlm.temperature, Some(-1.5));
        assert_eq!(tlm.adv_count, 256);
        // Unsigned even with the high bit set
        assert_eq!(tlm.sec_count, 0x8000_0001);
    }

    #[test]
    fn test_positive_temperature_fraction() {
        // ---
        let tlm = find_tlm_frame(&frame([0x0B, 0xB8], [0x15, 0x40])).unwrap();

        assert_eq!(tlm.battery_voltage, Some(3.0));
        assert_eq!(tlm.temperature, Some(21.25));
    }

    #[test]
    fn test_frame_found_after_advertisement_prefix() {
        // ---
        let mut bytes = vec![0x02, 0x01, 0x06, 0x03, 0x03, 0xAA, 0xFE, 0x11, 0x16];
        bytes.extend(frame([0x0C, 0x1C], [0x14, 0x00]));

        let tlm = find_tlm_frame(&bytes).unwrap();
        assert_eq!(tlm.temperature, Some(20.0));
    }

    #[test]
    fn test_truncated_frame_is_ignored() {
        // ---
        let mut bytes = frame([0x0C, 0x1C], [0x14, 0x00]);
        bytes.pop();

        assert_eq!(find_tlm_frame(&bytes), None);
        assert_eq!(find_tlm_frame(&[]), None);
    }

    #[test]
    fn test_metadata_shape() {
        // ---
        let tlm = find_tlm_frame(&frame([0x0C, 0x1C], [0xFE, 0x80])).unwrap();
        let value = tlm.to_json();

        assert_eq!(value["frame"], "eddystone-tlm");
        assert_eq!(value["batteryVoltage"], 3.1);
        assert_eq!(value["advCount"], 256);
    }
}
