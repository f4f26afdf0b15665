//! Telemetry payloads sent to the hub
//!
//! Each message carries the device id and a running message number:
//!
//! ```text
//! {"deviceId":"edison","messageId":3}
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::DeviceResult;

/// One telemetry message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMessage {
    /// Device the message comes from
    pub device_id: String,
    /// Running number, starting at 1
    pub message_id: u32,
}

impl TelemetryMessage {
    /// Build a message for a device
    pub fn new(device_id: impl Into<String>, message_id: u32) -> Self {
        Self {
            device_id: device_id.into(),
            message_id,
        }
    }

    /// Compact JSON text
    pub fn to_json(&self) -> DeviceResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Compact JSON bytes, ready to hand to a transport
    pub fn to_bytes(&self) -> DeviceResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format() {
        let msg = TelemetryMessage::new("edison", 7);
        assert_eq!(msg.to_json().unwrap(), r#"{"deviceId":"edison","messageId":7}"#);
    }

    #[test]
    fn escapes_device_id() {
        let msg = TelemetryMessage::new("a\"b", 1);
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"deviceId":"a\"b","messageId":1}"#);
        let back: TelemetryMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn bytes_match_text() {
        let msg = TelemetryMessage::new("edison", 20);
        assert_eq!(msg.to_bytes().unwrap(), msg.to_json().unwrap().into_bytes());
    }
}
