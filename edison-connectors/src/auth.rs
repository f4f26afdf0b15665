//! Device authentication
//!
//! ## Shared Access Signatures
//!
//! A SAS token proves possession of the device key without sending it:
//!
//! ```text
//! to_sign   = urlencode(resource_uri) + "\n" + expiry
//! signature = base64(hmac_sha256(base64decode(key), to_sign))
//! token     = "SharedAccessSignature sr=" + urlencode(resource_uri)
//!             + "&sig=" + urlencode(signature) + "&se=" + expiry
//! ```
//!
//! `expiry` is in seconds since the Unix epoch. [`TokenProvider`] caches the
//! current token and mints a new one shortly before it runs out.
//!
//! ## X.509
//!
//! With `x509=true` the device presents a client certificate instead. The
//! lessons keep it next to the binary as `<device-id>-cert.pem` and
//! `<device-id>-key.pem`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edison_core::ConnectionString;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::HubError;

type HmacSha256 = Hmac<Sha256>;

/// Lifetime of freshly minted tokens
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Tokens this close to expiry are replaced
const REFRESH_MARGIN_SECS: i64 = 60;

/// Resource a device token is scoped to
pub fn resource_uri(host: &str, device_id: &str) -> String {
    format!("{host}/devices/{device_id}")
}

/// Mint a SAS token for `resource_uri`, valid until `expiry` (Unix seconds)
pub fn generate_sas_token(resource_uri: &str, key: &str, expiry: i64) -> Result<String, HubError> {
    let key_bytes = STANDARD
        .decode(key)
        .map_err(|e| HubError::Auth(format!("shared access key is not valid base64: {e}")))?;

    let encoded_uri = urlencoding::encode(resource_uri);
    let to_sign = format!("{encoded_uri}\n{expiry}");

    let mut mac = HmacSha256::new_from_slice(&key_bytes)
        .map_err(|e| HubError::Auth(e.to_string()))?;
    mac.update(to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={encoded_uri}&sig={}&se={expiry}",
        urlencoding::encode(&signature)
    ))
}

/// How a device proves its identity
#[derive(Clone)]
pub enum Credentials {
    /// Device key, tokens minted on demand
    SasKey { key: String },
    /// Token supplied ready-made
    SasToken(String),
    /// Client certificate, material supplied through options
    X509,
}

impl Credentials {
    /// Credentials named by a connection string; X.509 wins over keys
    pub fn from_connection_string(conn: &ConnectionString) -> Result<Self, HubError> {
        if conn.x509 {
            Ok(Self::X509)
        } else if let Some(token) = &conn.shared_access_signature {
            Ok(Self::SasToken(token.clone()))
        } else if let Some(key) = &conn.shared_access_key {
            Ok(Self::SasKey { key: key.clone() })
        } else {
            Err(HubError::Auth("connection string carries no credentials".into()))
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SasKey { .. } => f.write_str("SasKey(<redacted>)"),
            Self::SasToken(_) => f.write_str("SasToken(<redacted>)"),
            Self::X509 => f.write_str("X509"),
        }
    }
}

/// Hands out valid tokens for one device
#[derive(Debug, Clone)]
pub struct TokenProvider {
    resource_uri: String,
    credentials: Credentials,
    ttl: Duration,
    cached: Option<(String, i64)>,
}

impl TokenProvider {
    /// Provider for the device named in a connection string
    pub fn new(conn: &ConnectionString) -> Result<Self, HubError> {
        Ok(Self {
            resource_uri: resource_uri(&conn.host_name, &conn.device_id),
            credentials: Credentials::from_connection_string(conn)?,
            ttl: DEFAULT_TOKEN_TTL,
            cached: None,
        })
    }

    /// Change the lifetime of minted tokens
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Device authenticates with a certificate
    pub fn is_x509(&self) -> bool {
        matches!(self.credentials, Credentials::X509)
    }

    /// Token valid at `now` (Unix seconds), or `None` for X.509
    pub fn token(&mut self, now: i64) -> Result<Option<String>, HubError> {
        let key = match &self.credentials {
            Credentials::X509 => return Ok(None),
            Credentials::SasToken(token) => return Ok(Some(token.clone())),
            Credentials::SasKey { key } => key,
        };

        if let Some((token, expiry)) = &self.cached {
            if now + REFRESH_MARGIN_SECS < *expiry {
                return Ok(Some(token.clone()));
            }
        }

        let expiry = now + self.ttl.as_secs() as i64;
        let token = generate_sas_token(&self.resource_uri, key, expiry)?;
        log::debug!("Minted SAS token for {} expiring at {expiry}", self.resource_uri);
        self.cached = Some((token.clone(), expiry));
        Ok(Some(token))
    }

    /// Token valid right now
    pub fn current(&mut self) -> Result<Option<String>, HubError> {
        self.token(chrono::Utc::now().timestamp())
    }
}

/// Read a PEM file into memory
pub fn read_pem(path: &Path) -> Result<String, HubError> {
    std::fs::read_to_string(path).map_err(|source| HubError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Paths of a device's certificate and private key inside `dir`
pub fn x509_paths(dir: &Path, device_id: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{device_id}-cert.pem")),
        dir.join(format!("{device_id}-key.pem")),
    )
}

/// Load `<device_id>-cert.pem` and `<device_id>-key.pem` from `dir`
pub fn load_x509_material(dir: &Path, device_id: &str) -> Result<(String, String), HubError> {
    let (cert_path, key_path) = x509_paths(dir, device_id);
    let certificate = read_pem(&cert_path)?;
    let private_key = read_pem(&key_path)?;
    Ok((certificate, private_key))
}
