//! Device-side core for the Edison IoT Hub lessons
//!
//! Everything a lesson program needs that does not talk to the network:
//! parsing the device connection string, driving the on-board LED through
//! GPIO, building telemetry payloads, decoding inbound commands and deciding
//! when the next message may go out.
//!
//! Key constraints:
//! - Single-threaded, polling style: nothing here spawns or blocks on I/O
//!   besides the GPIO writes themselves
//! - The send loop is a plain state machine so it can be tested without a hub
//!
//! ```no_run
//! use edison_core::{ConnectionString, Command};
//!
//! let conn: ConnectionString =
//!     "HostName=hub.azure-devices.net;DeviceId=edison;SharedAccessKey=a2V5".parse()?;
//! assert_eq!(conn.device_id, "edison");
//!
//! match Command::from_json(br#"{"command":"blink"}"#)? {
//!     Some(Command::Blink) => {} // light the LED
//!     _ => {}
//! }
//! # Ok::<(), edison_core::DeviceError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod connection_string;
pub mod errors;
pub mod gpio;
pub mod scheduler;
pub mod telemetry;
pub mod time;

// Public API
pub use command::Command;
pub use config::LessonConfig;
pub use connection_string::{device_id_from, uses_x509, ConnectionString};
pub use errors::{DeviceError, DeviceResult};
pub use gpio::{Led, MockPin, OutputPin, PinNumbering};
pub use scheduler::SendScheduler;
pub use telemetry::TelemetryMessage;
pub use time::{TimeSource, Timestamp};

#[cfg(feature = "sysfs")]
pub use gpio::SysfsPin;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
