//! Opportunistic decoding of the binary records a Participant forwards over its data
//! channel, used only to stamp a debug-mode latency timestamp before relaying them on.
//!
//! The payload format is whatever the connected producer/client pair has agreed on;
//! this crate doesn't define or enforce one. [`InputEnvelope`] recognizes a thin,
//! optional `latency` field by convention — if a forwarded message happens to carry
//! one, `relay_to_node` timing becomes visible end to end without either side coding
//! against a fixed schema. A payload that doesn't parse as JSON, or parses but has no
//! `latency` field, is forwarded unchanged.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A bag of named timestamps (microseconds since the Unix epoch) accumulated as a
/// message crosses process boundaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyTracker {
    #[serde(flatten)]
    pub timestamps: HashMap<String, u64>,
}

impl LatencyTracker {
    pub fn add_timestamp(&mut self, name: &str) {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        self.timestamps.insert(name.to_string(), micros);
    }
}

/// A forwarded input record, recognized only far enough to find its optional
/// `latency` field; everything else round-trips through `fields` untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputEnvelope {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub latency: Option<LatencyTracker>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Stamp `data` with a `relay_to_node` latency timestamp if it parses as an
/// [`InputEnvelope`] carrying a `latency` bag, returning the re-encoded bytes.
/// Returns `None` (meaning: forward `data` unchanged) for anything that doesn't parse.
pub fn stamp_relay_to_node(data: &[u8]) -> Option<Vec<u8>> {
    let mut envelope: InputEnvelope = serde_json::from_slice(data).ok()?;
    let latency = envelope.latency.get_or_insert_with(LatencyTracker::default);
    latency.add_timestamp("relay_to_node");
    serde_json::to_vec(&envelope).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_an_envelope_that_already_has_a_latency_bag() {
        let data = br#"{"latency":{"client_send":100},"kind":"move","dx":1}"#;
        let stamped = stamp_relay_to_node(data).expect("valid envelope");
        let envelope: InputEnvelope = serde_json::from_slice(&stamped).unwrap();
        let latency = envelope.latency.unwrap();
        assert_eq!(latency.timestamps.get("client_send"), Some(&100));
        assert!(latency.timestamps.contains_key("relay_to_node"));
        assert_eq!(envelope.fields.get("kind").unwrap(), "move");
    }

    #[test]
    fn adds_a_latency_bag_to_an_envelope_without_one() {
        let data = br#"{"kind":"move"}"#;
        let stamped = stamp_relay_to_node(data).expect("valid envelope");
        let envelope: InputEnvelope = serde_json::from_slice(&stamped).unwrap();
        assert!(envelope.latency.unwrap().timestamps.contains_key("relay_to_node"));
    }

    #[test]
    fn non_json_payloads_are_left_for_the_caller_to_forward_unchanged() {
        assert!(stamp_relay_to_node(b"\x01\x02\x03\xff").is_none());
    }
}
