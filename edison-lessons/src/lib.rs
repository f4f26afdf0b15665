//! Intel Edison IoT Hub lessons
//!
//! Three small device programs, each a single polling loop:
//!
//! | Binary    | Does |
//! |-----------|------|
//! | `lesson1` | Blinks the LED on pin 13 twenty times |
//! | `lesson3` | Sends twenty telemetry messages, flashing the LED on every ack |
//! | `lesson4` | Waits for `blink`/`stop` commands from the cloud |
//!
//! The loops live here as library functions, generic over the LED pin and
//! the hub client, so they can be driven by mocks under paused tokio time.

pub mod board;
pub mod cli;
pub mod error;
pub mod hub;
pub mod runner;

pub use board::{open_led, BoardPin};
pub use error::{LessonError, LessonResult};
pub use hub::{configure_tls, set_trusted_certs, set_x509_certificate, DeviceIdentity};
pub use runner::{run_blink, run_commands, run_telemetry, CommandSummary, TelemetrySummary};

/// Install the `[Device]`-prefixed logger used by the lesson binaries.
///
/// `RUST_LOG` overrides the default of `info` with `rumqttc` held at `warn`.
pub fn init_logging() {
    use std::io::Write;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info,rumqttc=warn"))
        .format(|buf, record| match record.level() {
            log::Level::Error => writeln!(buf, "[Device] ERROR: {}", record.args()),
            log::Level::Warn => writeln!(buf, "[Device] WARN: {}", record.args()),
            _ => writeln!(buf, "[Device] {}", record.args()),
        })
        .init();
}
