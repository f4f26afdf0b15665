//! Hub client setup shared by the connected lessons

use std::path::Path;

use edison_connectors::auth::load_x509_material;
use edison_connectors::{connect, HubClient, HubError, HubOption, Protocol};
use edison_core::{device_id_from, uses_x509, ConnectionString, DeviceError, LessonConfig};

use crate::error::{LessonError, LessonResult};

/// A device identity taken from the command line
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Parsed connection string
    pub connection: ConnectionString,
    /// Device id as it appears in the connection string
    pub device_id: String,
    /// The connection string asks for certificate authentication
    pub x509: bool,
}

impl DeviceIdentity {
    /// Read the identity out of a raw connection string
    pub fn from_argument(raw: Option<&str>) -> LessonResult<Self> {
        let raw = raw.ok_or(LessonError::MissingConnectionString)?;
        let device_id = device_id_from(raw).ok_or(DeviceError::MissingDeviceId)?;
        let connection = ConnectionString::parse(raw)?;

        Ok(Self {
            connection,
            device_id,
            x509: uses_x509(raw),
        })
    }

    /// Create an unconnected client for `protocol`
    pub fn client(&self, protocol: Protocol) -> LessonResult<Box<dyn HubClient>> {
        log::debug!("Connecting {} to {} over {protocol:?}", self.device_id, self.connection.host_name);
        Ok(connect(&self.connection, protocol)?)
    }
}

/// Hand `<device>-cert.pem` and `<device>-key.pem` from `dir` to the client
pub fn set_x509_certificate<C: HubClient + ?Sized>(client: &mut C, dir: &Path, device_id: &str) -> LessonResult<()> {
    let (certificate, private_key) = load_x509_material(dir, device_id)?;
    client.set_option(HubOption::X509Certificate(certificate))?;
    client.set_option(HubOption::X509PrivateKey(private_key))?;
    Ok(())
}

/// Hand the CA bundle at `path` to the client
pub fn set_trusted_certs<C: HubClient + ?Sized>(client: &mut C, path: &Path) -> LessonResult<()> {
    let pem = std::fs::read(path).map_err(|source| HubError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    client.set_option(HubOption::TrustedCerts(pem))?;
    Ok(())
}

/// TLS material a client needs before its first `do_work`.
///
/// Only MQTT takes certificates: HTTP runs on the system trust store and
/// refuses X.509 devices when the client is built. A CA bundle that cannot
/// be read is logged and the lesson carries on; the MQTT client then reports
/// the missing option when it tries to connect.
pub fn configure_tls<C: HubClient + ?Sized>(
    client: &mut C,
    protocol: Protocol,
    identity: &DeviceIdentity,
    config: &LessonConfig,
) -> LessonResult<()> {
    if protocol != Protocol::Mqtt {
        return Ok(());
    }

    if identity.x509 {
        set_x509_certificate(client, &config.certificate_dir, &identity.device_id)
            .map_err(|e| LessonError::X509(Box::new(e)))?;
    }

    if let Some(path) = &config.trusted_certs {
        if let Err(e) = set_trusted_certs(client, path) {
            log::error!("Failed to set TrustedCerts option: {e}");
        }
    }
    Ok(())
}
