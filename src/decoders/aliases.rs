//! Field-name spellings seen in the wild, per logical attribute.
//!
//! Resolution is first match wins, so order matters: the canonical firmware
//! spelling comes first, historical variants after it.

// MK1 gateway JSON
pub const MK1_GATEWAY_MAC: &[&str] = &["GatewayMAC", "GatewayMac", "gatewayMac"];
pub const MK1_BLE_MAC: &[&str] = &["BLEMAC", "BleMac", "bleMac"];
pub const MK1_RSSI: &[&str] = &["RSSI"];
pub const MK1_ADV_TYPE: &[&str] = &["AdvType"];
pub const MK1_RAW_DATA: &[&str] = &["RawData"];
pub const MK1_DISPLAY_NAME: &[&str] = &["BLEName"];

// MK2 envelope
pub const GATEWAY_MAC: &[&str] = &["GatewayMAC", "gatewayMac", "gateway"];
pub const BLE_MAC: &[&str] = &["BLEMAC", "mac", "bleMac"];
pub const RSSI: &[&str] = &["RSSI", "rssi"];
pub const ADV_TYPE: &[&str] = &["AdvType", "advType"];
pub const RAW_DATA: &[&str] = &["RawData", "rawData"];
pub const DISPLAY_NAME: &[&str] = &["BLEName", "name"];
pub const BATTERY_VOLTAGE: &[&str] = &["BattVoltage", "BaTtVol", "batteryVoltage"];
pub const TEMPERATURE: &[&str] = &["temperature", "Temp"];
pub const HUMIDITY: &[&str] = &["humidity", "Humidity"];
pub const TIMESTAMP: &[&str] = &["TimeStamp"];

/// Battery fields a gateway adds on top of the beacon's own telemetry.
pub const VENDOR_BATTERY: &[&str] = &["BattVoltage", "BaTtVol"];

pub const STATUS: &[&str] = &["status", "Status"];
pub const FORMAT: &str = "Format";
