//! Error Types for Device-Side Failures
//!
//! ## Error Categories
//!
//! Errors fall into three groups, matching what a lesson program does before
//! it ever reaches the network:
//!
//! ### Input
//! - `ConnectionString`: the string passed on the command line is malformed
//! - `MissingDeviceId`: no `DeviceId=` segment could be found
//! - `Config`: a lesson setting makes no sense (zero blinks, zero poll interval)
//!
//! ### Hardware
//! - `Gpio`: the pin could not be exported, configured or written
//! - `UnmappedPin`: the header pin has no kernel GPIO behind it
//!
//! ### Data
//! - `Io`: a certificate or key file could not be read
//! - `Json`: a payload could not be encoded or decoded
//!
//! ## Handling Strategy
//!
//! ```rust
//! use edison_core::{ConnectionString, DeviceError};
//!
//! fn start(raw: &str) -> i32 {
//!     match raw.parse::<ConnectionString>() {
//!         Ok(_) => 0,
//!         Err(DeviceError::MissingDeviceId) => {
//!             // Cannot address the hub without an identity
//!             1
//!         }
//!         Err(_) => 1,
//!     }
//! }
//! assert_eq!(start("HostName=h;SharedAccessKey=k"), 1);
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Result type for device-side operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Device-side errors
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Connection string is malformed
    #[error("Invalid connection string: {reason}")]
    ConnectionString {
        /// What is wrong with it
        reason: String,
    },

    /// No device id could be parsed out of the connection string
    #[error("Cannot parse device id from IoT device connection string")]
    MissingDeviceId,

    /// GPIO export, direction or write failed
    #[error("GPIO {pin} failed: {reason}")]
    Gpio {
        /// Kernel GPIO number
        pin: u32,
        /// Underlying failure
        reason: String,
    },

    /// Header pin without a kernel GPIO mapping
    #[error("Pin {pin} is not mapped on the Arduino breakout")]
    UnmappedPin {
        /// Header pin number as printed on the board
        pin: u32,
    },

    /// File could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// JSON encode or decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Lesson configuration is unusable
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DeviceError {
    pub(crate) fn connection_string(reason: impl Into<String>) -> Self {
        Self::ConnectionString {
            reason: reason.into(),
        }
    }
}
