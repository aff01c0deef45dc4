//! Gateway payload decoders.
//!
//! Pure functions from a raw payload to zero or more [`NormalizedRecord`]s.
//! A decoder never fails: malformed input produces an empty list and a
//! debug-level diagnostic. Decoding the same payload twice yields the same
//! records.

use std::fmt;

use crate::models::NormalizedRecord;

pub mod aliases;
pub mod helpers;
pub mod mk1;
pub mod mk2;
pub mod tlm;

// ---

/// Wire protocol spoken by a gateway, selected by the MQTT topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    /// JSON array with a gateway entry and raw beacon entries.
    Mk1,
    /// Flexible JSON / base64 envelope.
    Mk2,
    /// MK1 wire format under its own topic, with an MK2 fallback.
    Mk3,
}

impl ProtocolFamily {
    pub const ALL: [ProtocolFamily; 3] = [ProtocolFamily::Mk1, ProtocolFamily::Mk2, ProtocolFamily::Mk3];

    pub fn topic(self) -> &'static str {
        // ---
        match self {
            ProtocolFamily::Mk1 => "devices/MK1",
            ProtocolFamily::Mk2 => "devices/MK2",
            ProtocolFamily::Mk3 => "devices/MK3",
        }
    }

    /// Unknown topics have no decoder.
    pub fn from_topic(topic: &str) -> Option<Self> {
        // ---
        Self::ALL.into_iter().find(|family| family.topic() == topic)
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let name = match self {
            ProtocolFamily::Mk1 => "MK1",
            ProtocolFamily::Mk2 => "MK2",
            ProtocolFamily::Mk3 => "MK3",
        };
        f.write_str(name)
    }
}

pub fn decode(family: ProtocolFamily, payload: &str) -> Vec<NormalizedRecord> {
    // ---
    match family {
        ProtocolFamily::Mk1 => mk1::decode(payload),
        ProtocolFamily::Mk2 => mk2::decode(payload),
        ProtocolFamily::Mk3 => {
            let records = mk1::decode(payload);
            if records.is_empty() {
                mk2::decode(payload)
            } else {
                records
            }
        }
    }
}

/// Decode a message by topic; unknown topics yield nothing.
pub fn decode_topic(topic: &str, payload: &str) -> Vec<NormalizedRecord> {
    // ---
    ProtocolFamily::from_topic(topic)
        .map(|family| decode(family, payload))
        .unwrap_or_default()
}
