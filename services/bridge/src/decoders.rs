//! Payload decoder registry.
//!
//! The registry maps a device-type string (from the inventory) to a pure
//! `hex → JSON object` function.  It is populated once at startup from the
//! compiled-in factory and immutable afterwards.  Dispatch is by the
//! device's inventory type, never by message type.

use serde_json::{json, Value};
use std::collections::HashMap;

/// A payload decoder: hex string in, JSON object out.
pub type DecodeFn = fn(&str) -> Result<Value, PayloadDecodeError>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable device-type → decoder mapping.
pub struct DecoderRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl DecoderRegistry {
    /// Build a registry from `(type_tag, decode_fn)` pairs.
    pub fn from_factory(pairs: Vec<(&'static str, DecodeFn)>) -> DecoderRegistry {
        DecoderRegistry {
            decoders: pairs.into_iter().collect(),
        }
    }

    /// The registry of decoders compiled into this binary.
    pub fn builtin() -> DecoderRegistry {
        DecoderRegistry::from_factory(builtin_factory())
    }

    pub fn get(&self, device_type: &str) -> Option<DecodeFn> {
        self.decoders.get(device_type).copied()
    }

    /// Registered type tags, for startup logging.
    pub fn type_tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<&'static str> = self.decoders.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

/// All decoders compiled into the binary.
pub fn builtin_factory() -> Vec<(&'static str, DecodeFn)> {
    vec![("tracknet-gps", decode_tracknet_gps)]
}

// ---------------------------------------------------------------------------
// TrackNet GPS tracker
// ---------------------------------------------------------------------------

// Frame layout: Data Channel (1 byte) | Data Type (1 byte) | Data (N bytes)
//
//   Channel  Type  Size  Meaning
//   0x00     0xFF  2     battery voltage, 0.01 V/LSB signed
//   0x01     0x88  9     GPS, 3-byte lat/lon/alt
//                        (lat/lon 0.0001° signed, alt 0.01 m signed)

fn decode_tracknet_gps(payload: &str) -> Result<Value, PayloadDecodeError> {
    let bytes = hex::decode(payload).map_err(|e| PayloadDecodeError::Hex(e.to_string()))?;

    let mut decoded = serde_json::Map::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let channel = bytes[offset];
        match (channel, bytes.get(offset + 1)) {
            (0x00, Some(0xff)) => {
                let data = field(&bytes, offset + 2, 2, channel)?;
                let raw = i16::from_be_bytes([data[0], data[1]]);
                decoded.insert("battery".to_owned(), json!(f64::from(raw) * 0.01));
                offset += 4;
            }
            (0x01, Some(0x88)) => {
                let data = field(&bytes, offset + 2, 9, channel)?;
                let lat = f64::from(three_byte_signed(&data[0..3])) * 0.0001;
                let lon = f64::from(three_byte_signed(&data[3..6])) * 0.0001;
                let alt = f64::from(three_byte_signed(&data[6..9])) * 0.01;
                decoded.insert("gps".to_owned(), json!([lat, lon, alt]));
                offset += 11;
            }
            _ => return Err(PayloadDecodeError::UnknownChannel(channel)),
        }
    }
    Ok(Value::Object(decoded))
}

fn field<'a>(
    bytes: &'a [u8],
    start: usize,
    len: usize,
    channel: u8,
) -> Result<&'a [u8], PayloadDecodeError> {
    bytes
        .get(start..start + len)
        .ok_or(PayloadDecodeError::Truncated { channel, need: len })
}

/// A 24-bit big-endian signed value.
fn three_byte_signed(value: &[u8]) -> i32 {
    let raw = (i32::from(value[0]) << 16) | (i32::from(value[1]) << 8) | i32::from(value[2]);
    if raw & 0x80_0000 != 0 {
        raw - 0x100_0000
    } else {
        raw
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// A decoder failure.  The message itself is still forwarded, without an
/// attached payload.
#[derive(Debug)]
pub enum PayloadDecodeError {
    /// The payload is not valid hex.
    Hex(String),
    /// A channel promised more data bytes than the frame holds.
    Truncated { channel: u8, need: usize },
    /// A channel byte outside the device's channel map.
    UnknownChannel(u8),
}

impl std::fmt::Display for PayloadDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadDecodeError::Hex(s) => write!(f, "invalid hex payload: {}", s),
            PayloadDecodeError::Truncated { channel, need } => {
                write!(f, "channel {:#04x} truncated, needs {} data bytes", channel, need)
            }
            PayloadDecodeError::UnknownChannel(c) => write!(f, "unknown data channel {:#04x}", c),
        }
    }
}

impl std::error::Error for PayloadDecodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn decodes_battery_channel() {
        let value = decode_tracknet_gps("00FF0169").expect("decode");
        assert!(close(value["battery"].as_f64().unwrap(), 3.61));
    }

    #[test]
    fn decodes_negative_battery() {
        // -361 as i16 big-endian
        let value = decode_tracknet_gps("00FFFE97").expect("decode");
        assert!(close(value["battery"].as_f64().unwrap(), -3.61));
    }

    #[test]
    fn decodes_combined_gps_and_battery_frame() {
        let value = decode_tracknet_gps("018808814905BF1400629800FF0152").expect("decode");
        let gps = value["gps"].as_array().expect("gps array");
        assert!(close(gps[0].as_f64().unwrap(), 55.7385));
        assert!(close(gps[1].as_f64().unwrap(), 37.6596));
        assert!(close(gps[2].as_f64().unwrap(), 252.40));
        assert!(close(value["battery"].as_f64().unwrap(), 3.38));
    }

    #[test]
    fn rejects_non_hex_payload() {
        assert!(matches!(
            decode_tracknet_gps("zz"),
            Err(PayloadDecodeError::Hex(_))
        ));
    }

    #[test]
    fn rejects_truncated_channel() {
        assert!(matches!(
            decode_tracknet_gps("00FF01"),
            Err(PayloadDecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unknown_channel() {
        assert!(matches!(
            decode_tracknet_gps("0B67"),
            Err(PayloadDecodeError::UnknownChannel(0x0b))
        ));
    }

    #[test]
    fn builtin_registry_resolves_by_device_type() {
        let registry = DecoderRegistry::builtin();
        assert!(registry.get("tracknet-gps").is_some());
        assert!(registry.get("unknown-device").is_none());
        assert_eq!(registry.type_tags(), vec!["tracknet-gps"]);
    }
}
