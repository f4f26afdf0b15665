//! IoT Hub device connection strings
//!
//! A device connection string is a `;`-separated list of `Key=Value` pairs:
//!
//! ```text
//! HostName=myhub.azure-devices.net;DeviceId=edison;SharedAccessKey=c2VjcmV0
//! HostName=myhub.azure-devices.net;DeviceId=edison;x509=true
//! ```
//!
//! Two lenient helpers, [`device_id_from`] and [`uses_x509`], work on the raw
//! string by substring search so a lesson can pick out the device id before
//! (and independently of) full parsing.

use std::fmt;
use std::str::FromStr;

use crate::errors::{DeviceError, DeviceResult};

const DEVICE_ID_MARKER: &str = "DeviceId=";
const X509_MARKER: &str = "x509=true";

/// Extract the device id from a raw connection string.
///
/// Takes the text after the first `DeviceId=` up to the next `;` (or the end
/// of the string). Returns `None` when the marker is absent.
pub fn device_id_from(raw: &str) -> Option<String> {
    let start = raw.find(DEVICE_ID_MARKER)? + DEVICE_ID_MARKER.len();
    let rest = &raw[start..];
    let end = rest.find(';').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

/// True when the connection string asks for X.509 authentication.
pub fn uses_x509(raw: &str) -> bool {
    raw.contains(X509_MARKER)
}

/// Parsed device connection string
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// IoT Hub host, e.g. `myhub.azure-devices.net`
    pub host_name: String,
    /// Device identity registered in the hub
    pub device_id: String,
    /// Base64 device key used to mint SAS tokens
    pub shared_access_key: Option<String>,
    /// Pre-minted SAS token
    pub shared_access_signature: Option<String>,
    /// Edge gateway to connect through instead of the hub
    pub gateway_host_name: Option<String>,
    /// Authenticate with a client certificate
    pub x509: bool,
}

impl ConnectionString {
    /// Parse a connection string, validating that it identifies a device and
    /// carries some credential.
    pub fn parse(raw: &str) -> DeviceResult<Self> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;
        let mut shared_access_signature = None;
        let mut gateway_host_name = None;
        let mut x509 = false;

        for segment in raw.trim().split(';').filter(|s| !s.is_empty()) {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                DeviceError::connection_string(format!("segment '{segment}' has no '='"))
            })?;

            match key {
                "HostName" => host_name = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.to_string()),
                "SharedAccessSignature" => shared_access_signature = Some(value.to_string()),
                "GatewayHostName" => gateway_host_name = Some(value.to_string()),
                "x509" => x509 = value == "true",
                other => log::debug!("Ignoring connection string key {other}"),
            }
        }

        let host_name = host_name
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DeviceError::connection_string("missing HostName"))?;
        let device_id = device_id
            .filter(|d| !d.is_empty())
            .ok_or(DeviceError::MissingDeviceId)?;

        if shared_access_key.is_none() && shared_access_signature.is_none() && !x509 {
            return Err(DeviceError::connection_string(
                "no SharedAccessKey, SharedAccessSignature or x509=true",
            ));
        }

        Ok(Self {
            host_name,
            device_id,
            shared_access_key,
            shared_access_signature,
            gateway_host_name,
            x509,
        })
    }

    /// Host the transport should connect to
    pub fn endpoint_host(&self) -> &str {
        self.gateway_host_name.as_deref().unwrap_or(&self.host_name)
    }
}

impl FromStr for ConnectionString {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostName={};DeviceId={}", self.host_name, self.device_id)?;
        if let Some(gateway) = &self.gateway_host_name {
            write!(f, ";GatewayHostName={gateway}")?;
        }
        if self.shared_access_key.is_some() {
            f.write_str(";SharedAccessKey=<redacted>")?;
        }
        if self.shared_access_signature.is_some() {
            f.write_str(";SharedAccessSignature=<redacted>")?;
        }
        if self.x509 {
            f.write_str(";x509=true")?;
        }
        Ok(())
    }
}

// Debug goes through Display so keys never end up in logs
impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionString({self})")
    }
}
