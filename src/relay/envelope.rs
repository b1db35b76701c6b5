//! Relay wire format.
//!
//! The outer frame is plain JSON over the WebSocket; only the
//! `encryptedPayload` field is confidential. `target` routes frames inside
//! the relay: `product` for camera-bound frames, `device` for phone-bound.

use serde::{Deserialize, Serialize};

pub const TARGET_PRODUCT: &str = "product";
pub const TARGET_DEVICE: &str = "device";

/// The outer JSON frame exchanged with the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(rename = "productId")]
    pub product_id: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "encryptedPayload")]
    pub encrypted_payload: String,
}

impl Envelope {
    /// An outbound device-targeted envelope.
    pub fn to_device(
        msg_type: impl Into<String>,
        product_id: impl Into<String>,
        device_id: impl Into<String>,
        encrypted_payload: impl Into<String>,
    ) -> Self {
        Self {
            msg_type: msg_type.into(),
            target: Some(TARGET_DEVICE.to_string()),
            product_id: product_id.into(),
            device_id: device_id.into(),
            encrypted_payload: encrypted_payload.into(),
        }
    }
}

/// Compose the relay connection URL for a camera.
///
/// A bare domain dials `wss://`; a domain that already carries a scheme
/// (LAN relays, tests) is used as-is.
pub fn relay_url(domain: &str, product_id: &str) -> String {
    if domain.contains("://") {
        format!("{domain}/ws?product-id={product_id}")
    } else {
        format!("wss://{domain}/ws?product-id={product_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_defaults_to_wss() {
        assert_eq!(
            relay_url("relay.example.com", "cam-1"),
            "wss://relay.example.com/ws?product-id=cam-1"
        );
    }

    #[test]
    fn url_keeps_explicit_scheme() {
        assert_eq!(
            relay_url("ws://127.0.0.1:9001", "cam-1"),
            "ws://127.0.0.1:9001/ws?product-id=cam-1"
        );
    }

    #[test]
    fn envelope_wire_field_names() {
        let env = Envelope::to_device("wifiScanResult", "cam-1", "dev-1", "abc=");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "wifiScanResult");
        assert_eq!(json["target"], "device");
        assert_eq!(json["productId"], "cam-1");
        assert_eq!(json["deviceId"], "dev-1");
        assert_eq!(json["encryptedPayload"], "abc=");
    }

    #[test]
    fn inbound_envelope_parses_without_target() {
        let env: Envelope = serde_json::from_str(
            r#"{"type":"getDevices","productId":"cam-1","deviceId":"dev-1","encryptedPayload":"zz"}"#,
        )
        .unwrap();
        assert_eq!(env.msg_type, "getDevices");
        assert_eq!(env.target, None);
    }
}
