//! # Protocol
//!
//! The application-level envelope carried inside every WebSocket text frame.
//!
//! All messages are JSON. Simple, human-readable, debuggable. Anyone can
//! inspect the WebSocket traffic and understand it immediately:
//!
//! ```text
//! { "type": "new_message", "data": { ... } }
//! ```
//!
//! The push core treats `data` as opaque. Giving meaning to an envelope is
//! the message router's job; the core only produces `connected` (right
//! after the handshake) and `user_offline` (when a peer drops). Everything
//! else (`new_message`, `message_read`, `user_online`, `new_post`,
//! `post_liked`, `gift_sent`, `notification`) passes through untouched.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Envelope type emitted by the core to a freshly connected peer.
pub const TYPE_CONNECTED: &str = "connected";

/// Envelope type broadcast by the core when a peer disconnects.
pub const TYPE_USER_OFFLINE: &str = "user_offline";

/// All messages are wrapped in this envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(msg_type: &str, data: &T) -> Self {
        let data = serde_json::to_value(data).unwrap_or_else(|e| {
            // Un-JSON-able data (a map with non-string keys, say) must not
            // take the connection down; degrade to null like any other
            // dispatch failure, but say so.
            warn!(msg_type, error = %e, "envelope data failed to serialize, sending null");
            serde_json::Value::Null
        });
        Self {
            msg_type: msg_type.to_string(),
            data,
        }
    }

    /// Parse the payload of a text frame.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            warn!(msg_type = %self.msg_type, error = %e, "envelope failed to serialize");
            String::new()
        })
    }

    /// The `connected` envelope sent to a peer right after registration.
    pub fn connected(client_id: &str) -> Self {
        Self::new(TYPE_CONNECTED, &serde_json::json!({ "clientId": client_id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_type_and_data() {
        let env = Envelope::from_payload(br#"{"type":"new_message","data":{"text":"hi"}}"#)
            .expect("valid envelope");
        assert_eq!(env.msg_type, "new_message");
        assert_eq!(env.data["text"], "hi");
    }

    #[test]
    fn envelope_data_defaults_to_null() {
        let env = Envelope::from_payload(br#"{"type":"message_read"}"#).expect("valid envelope");
        assert_eq!(env.msg_type, "message_read");
        assert!(env.data.is_null());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(Envelope::from_payload(b"{not json").is_err());
    }

    #[test]
    fn unserializable_data_degrades_to_null() {
        use std::collections::BTreeMap;

        // Tuple keys have no JSON representation.
        let mut map = BTreeMap::new();
        map.insert((1u8, 2u8), "pair");
        let env = Envelope::new("new_message", &map);
        assert_eq!(env.msg_type, "new_message");
        assert!(env.data.is_null());
    }

    #[test]
    fn connected_envelope_carries_client_id() {
        let env = Envelope::connected("abc-1234");
        let json = env.to_json();
        let back = Envelope::from_payload(json.as_bytes()).unwrap();
        assert_eq!(back.msg_type, TYPE_CONNECTED);
        assert_eq!(back.data["clientId"], "abc-1234");
    }
}
