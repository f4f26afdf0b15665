//! IoT Hub Device Clients for the Edison Lessons
//!
//! ## Overview
//!
//! This crate connects a device to an Azure IoT Hub. Every transport exposes
//! the same pump-driven client: hand a message over with
//! [`HubClient::send_event`], then call [`HubClient::do_work`] regularly to
//! drive I/O and collect what happened since the last call.
//!
//! ```text
//!  lesson loop                     HubClient
//!  ───────────                     ─────────
//!  send_event(payload) ──────────▶ queue / publish      ─▶ MessageId
//!  do_work()           ──────────▶ drive transport      ─▶ [HubEvent]
//!      SendConfirmed { id, result }   (ack for a message)
//!      Message(CloudMessage)          (cloud-to-device)
//!  complete(msg, Accepted) ──────▶ settle the inbound message
//!  sleep(work_interval)
//! ```
//!
//! ## Protocol Selection
//!
//! ### MQTT
//! - Persistent TLS connection on port 8883
//! - Telemetry acknowledged by PUBACK (QoS 1)
//! - Cloud-to-device messages pushed as soon as they are queued
//! - SAS token or X.509 client certificate authentication
//!
//! ### HTTP
//! - One HTTPS request per telemetry message
//! - Cloud-to-device messages fetched by polling, throttled by
//!   `MinPollingTime`
//! - Messages can be completed, abandoned or rejected
//! - SAS token authentication only
//!
//! ## Example Usage
//!
//! ```no_run
//! use edison_connectors::{connect, HubClient, HubEvent, Protocol};
//! use edison_core::ConnectionString;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn: ConnectionString =
//!     "HostName=hub.azure-devices.net;DeviceId=edison;SharedAccessKey=a2V5".parse()?;
//! let mut client = connect(&conn, Protocol::Http)?;
//!
//! let id = client.send_event(br#"{"deviceId":"edison","messageId":1}"#.to_vec()).await?;
//! for event in client.do_work().await? {
//!     if let HubEvent::SendConfirmed { id: acked, result } = event {
//!         assert_eq!(acked, id);
//!         println!("message {acked}: {result:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

use edison_core::{ConnectionString, DeviceError};
use thiserror::Error;

pub mod auth;

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "http")]
pub mod http;

// Re-export common types
pub use auth::{generate_sas_token, Credentials, TokenProvider};

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConfig, MqttHubClient};

#[cfg(feature = "http")]
pub use http::{HttpConfig, HttpHubClient};

/// Identifier handed back for every telemetry message, unique per client
pub type MessageId = u64;

/// Common hub client errors
#[derive(Debug, Error)]
pub enum HubError {
    /// The transport has no live connection
    #[error("Not connected")]
    NotConnected,

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Credentials missing or rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Network or request error
    #[error("Request failed: {0}")]
    Request(String),

    /// Hub returned an error status
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Option the transport cannot honour
    #[error("Option {option} is not supported over {transport}")]
    UnsupportedOption {
        option: &'static str,
        transport: &'static str,
    },

    /// Certificate or key file could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Device-side failure (connection string, payload)
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Outcome of a telemetry message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The hub accepted the message
    Ok,
    /// The message was lost or refused
    Error(String),
}

impl Confirmation {
    /// True for [`Confirmation::Ok`]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// How an inbound message is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove it from the device queue
    Accepted,
    /// Not processed; make it available again
    Abandoned,
    /// Never deliver it again
    Rejected,
}

/// Cloud-to-device message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloudMessage {
    /// Raw body
    pub body: Vec<u8>,
    /// Application properties attached by the sender
    pub properties: Vec<(String, String)>,
    /// Token needed to settle the message (HTTP)
    pub lock_token: Option<String>,
    /// Topic it arrived on (MQTT)
    pub topic: Option<String>,
}

impl CloudMessage {
    /// Message with just a body
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Body as text, invalid UTF-8 replaced
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Look up an application property
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Something that happened since the last `do_work`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// A telemetry message was settled
    SendConfirmed {
        id: MessageId,
        result: Confirmation,
    },
    /// A cloud-to-device message arrived
    Message(CloudMessage),
}

/// Client options, set before the first `do_work`
#[derive(Debug, Clone)]
pub enum HubOption {
    /// PEM bundle of CAs the hub certificate must chain to
    TrustedCerts(Vec<u8>),
    /// PEM client certificate for X.509 authentication
    X509Certificate(String),
    /// PEM private key for X.509 authentication
    X509PrivateKey(String),
    /// Minimum gap between polls for cloud-to-device messages
    MinPollingTime(Duration),
    /// MQTT keep-alive interval
    KeepAlive(Duration),
}

impl HubOption {
    /// Option name as used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::TrustedCerts(_) => "TrustedCerts",
            Self::X509Certificate(_) => "x509certificate",
            Self::X509PrivateKey(_) => "x509privatekey",
            Self::MinPollingTime(_) => "MinimumPollingTime",
            Self::KeepAlive(_) => "keepalive",
        }
    }
}

/// Transport to reach the hub with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// MQTT over TLS
    Mqtt,
    /// HTTPS REST
    Http,
}

impl std::str::FromStr for Protocol {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Self::Mqtt),
            "http" | "https" => Ok(Self::Http),
            other => Err(HubError::Config(format!("unknown protocol '{other}'"))),
        }
    }
}

/// Pump-driven IoT Hub device client
#[async_trait::async_trait]
pub trait HubClient: Send {
    /// Hand a telemetry message to the transport
    async fn send_event(&mut self, payload: Vec<u8>) -> Result<MessageId, HubError>;

    /// Drive I/O once and report what happened since the last call
    async fn do_work(&mut self) -> Result<Vec<HubEvent>, HubError>;

    /// Settle an inbound message
    async fn complete(&mut self, message: &CloudMessage, disposition: Disposition) -> Result<(), HubError>;

    /// Set a client option
    fn set_option(&mut self, option: HubOption) -> Result<(), HubError>;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats;

    /// Shut the connection down
    async fn close(&mut self) -> Result<(), HubError>;
}

/// Connection statistics common to all clients
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Total messages confirmed by the hub
    pub messages_sent: u64,
    /// Total messages failed to send
    pub messages_failed: u64,
    /// Total cloud-to-device messages received
    pub messages_received: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Number of reconnections
    pub reconnections: u32,
    /// Last error message
    pub last_error: Option<String>,
}

/// Create a client for a device connection string
pub fn connect(conn: &ConnectionString, protocol: Protocol) -> Result<Box<dyn HubClient>, HubError> {
    match protocol {
        #[cfg(feature = "mqtt")]
        Protocol::Mqtt => Ok(Box::new(MqttHubClient::new(conn, MqttConfig::new(conn))?)),
        #[cfg(feature = "http")]
        Protocol::Http => Ok(Box::new(HttpHubClient::new(conn, HttpConfig::new(conn))?)),
        #[allow(unreachable_patterns)]
        other => Err(HubError::Config(format!("{other:?} support is not compiled in"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_from_str() {
        assert_eq!("MQTT".parse::<Protocol>().unwrap(), Protocol::Mqtt);
        assert_eq!("https".parse::<Protocol>().unwrap(), Protocol::Http);
        assert!("amqp".parse::<Protocol>().is_err());
    }

    #[test]
    fn cloud_message_accessors() {
        let mut msg = CloudMessage::new(br#"{"command":"blink"}"#.to_vec());
        msg.properties.push(("source".into(), "portal".into()));
        assert_eq!(msg.body_text(), r#"{"command":"blink"}"#);
        assert_eq!(msg.property("source"), Some("portal"));
        assert_eq!(msg.property("missing"), None);
    }

    #[test]
    fn option_names() {
        assert_eq!(HubOption::TrustedCerts(Vec::new()).name(), "TrustedCerts");
        assert_eq!(HubOption::MinPollingTime(Duration::from_secs(1)).name(), "MinimumPollingTime");
    }

    #[test]
    fn connect_picks_transport() {
        let conn: ConnectionString = "HostName=hub.azure-devices.net;DeviceId=edison;SharedAccessKey=a2V5"
            .parse()
            .unwrap();
        assert!(connect(&conn, Protocol::Http).is_ok());
        assert!(connect(&conn, Protocol::Mqtt).is_ok());
    }
}
