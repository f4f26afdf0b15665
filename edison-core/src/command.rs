//! Cloud-to-device commands
//!
//! Inbound messages are small JSON documents; only the top-level `command`
//! string matters:
//!
//! ```text
//! {"command":"blink"}
//! {"command":"stop"}
//! ```
//!
//! Anything else in the document is ignored. A document without a string
//! `command` is not an error, it just carries no command.

use std::fmt;

use serde_json::Value;

use crate::errors::DeviceResult;

const COMMAND_POINTER: &str = "/command";

/// Command carried by a cloud-to-device message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Flash the LED once
    Blink,
    /// Stop listening and exit
    Stop,
    /// A command string this device does not know
    Unknown(String),
}

impl Command {
    /// Decode the command from a message body.
    ///
    /// Invalid UTF-8 is replaced before decoding. Malformed JSON is an error;
    /// a missing or non-string `command` gives `Ok(None)`.
    pub fn from_json(payload: &[u8]) -> DeviceResult<Option<Self>> {
        let text = String::from_utf8_lossy(payload);
        let document: Value = serde_json::from_str(&text)?;

        Ok(document
            .pointer(COMMAND_POINTER)
            .and_then(Value::as_str)
            .map(Self::from_name))
    }

    fn from_name(name: &str) -> Self {
        match name {
            "blink" => Self::Blink,
            "stop" => Self::Stop,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blink => f.write_str("blink"),
            Self::Stop => f.write_str("stop"),
            Self::Unknown(name) => write!(f, "unknown ({name})"),
        }
    }
}
