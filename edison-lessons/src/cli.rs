//! Command-line arguments
//!
//! Every flag falls back to an `EDISON_*` environment variable, so a board
//! can be configured once in its service unit.

use clap::{Args, Parser};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use edison_connectors::Protocol;
use edison_core::{LessonConfig, PinNumbering};

/// CA bundle shipped by most Linux images, including the Edison's Yocto build
pub const DEFAULT_TRUSTED_CERTS: &str = "/etc/ssl/certs/ca-certificates.crt";

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

/// LED settings shared by every lesson
#[derive(Clone, Debug, Args)]
pub struct LedArgs {
    /// Pin the LED is wired to
    #[arg(env = "EDISON_LED_PIN", long = "led-pin", value_name = "pin", default_value_t = 13)]
    pub led_pin: u32,

    /// How --led-pin is numbered: "arduino" header pins or raw "linux" GPIOs
    #[arg(
        env = "EDISON_PIN_NUMBERING",
        long = "pin-numbering",
        value_name = "scheme",
        default_value = "arduino"
    )]
    pub numbering: PinNumbering,

    /// Blinks or messages before exiting
    #[arg(
        env = "EDISON_MAX_BLINK_TIMES",
        long = "max-blink-times",
        value_name = "n",
        default_value_t = 20
    )]
    pub max_blink_times: u32,

    /// Log LED changes instead of driving the GPIO
    #[arg(long = "dry-run")]
    pub dry_run: bool,
}

impl LedArgs {
    /// Base lesson configuration for these LED settings
    pub fn lesson_config(&self) -> LessonConfig {
        LessonConfig::new()
            .led_pin(self.led_pin)
            .numbering(self.numbering)
            .max_blink_times(self.max_blink_times)
    }
}

/// Lesson 1: blink the on-board LED
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct BlinkCli {
    #[command(flatten)]
    pub led: LedArgs,
}

/// Hub connection settings for lessons 3 and 4
#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct HubCli {
    /// Device connection string from the IoT Hub portal
    #[arg(env = "EDISON_CONNECTION_STRING", value_name = "connection-string", hide_env_values = true)]
    pub connection_string: Option<String>,

    /// Transport: "mqtt" or "http"
    #[arg(env = "EDISON_PROTOCOL", long = "protocol", value_name = "protocol")]
    pub protocol: Option<Protocol>,

    /// Directory holding <device>-cert.pem and <device>-key.pem for X.509 devices
    #[arg(
        env = "EDISON_CERTIFICATE_DIR",
        long = "certificate-dir",
        value_name = "dir",
        default_value = "."
    )]
    pub certificate_dir: PathBuf,

    /// PEM bundle of CAs trusted for the hub's TLS certificate
    #[arg(
        env = "EDISON_TRUSTED_CERTS",
        long = "trusted-certs",
        value_name = "path",
        default_value = DEFAULT_TRUSTED_CERTS
    )]
    pub trusted_certs: PathBuf,

    /// Minimum gap between HTTP polls for commands, in milliseconds
    #[arg(
        env = "EDISON_MIN_POLLING_TIME_MS",
        long = "min-polling-time-ms",
        value_name = "ms",
        value_parser = parse_duration
    )]
    pub min_polling_time: Option<Duration>,

    #[command(flatten)]
    pub led: LedArgs,
}

impl HubCli {
    /// Transport to use, falling back to the lesson's own default
    pub fn protocol_or(&self, default: Protocol) -> Protocol {
        self.protocol.unwrap_or(default)
    }

    /// Lesson configuration with the hub settings applied
    pub fn lesson_config(&self) -> LessonConfig {
        let config = self
            .led
            .lesson_config()
            .certificate_dir(self.certificate_dir.clone())
            .trusted_certs(self.trusted_certs.clone());

        match self.min_polling_time {
            Some(interval) => config.min_polling_time(interval),
            None => config,
        }
    }
}
