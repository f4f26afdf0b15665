//! Lesson errors

use edison_connectors::HubError;
use edison_core::DeviceError;
use thiserror::Error;

/// Result type for lesson runs
pub type LessonResult<T> = Result<T, LessonError>;

/// Anything that ends a lesson early
#[derive(Debug, Error)]
pub enum LessonError {
    /// LED, configuration or payload failure
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Hub client failure
    #[error(transparent)]
    Hub(#[from] HubError),

    /// Certificate or key for an X.509 device could not be handed to the client
    #[error("Failed to set options for x509: {0}")]
    X509(Box<LessonError>),

    /// No connection string on the command line or in the environment
    #[error("IoT device connection string should be passed as a parameter")]
    MissingConnectionString,
}
