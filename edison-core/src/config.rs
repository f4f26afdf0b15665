//! Lesson configuration
//!
//! Defaults reproduce the stock lessons: LED on header pin 13, twenty blinks
//! or messages, a message every two seconds, and the work loop pumped every
//! 100 ms.
//!
//! ```rust
//! use std::time::Duration;
//! use edison_core::LessonConfig;
//!
//! let config = LessonConfig::new()
//!     .max_blink_times(5)
//!     .send_interval(Duration::from_secs(10));
//! config.validate()?;
//! # Ok::<(), edison_core::DeviceError>(())
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{DeviceError, DeviceResult};
use crate::gpio::PinNumbering;

/// Header pin the on-board LED is wired to
pub const DEFAULT_LED_PIN: u32 = 13;
/// Blinks (lesson 1) or messages (lesson 3) before the program exits
pub const DEFAULT_MAX_BLINK_TIMES: u32 = 20;

/// Settings shared by all lessons
#[derive(Debug, Clone)]
pub struct LessonConfig {
    /// LED pin, read according to `numbering`
    pub led_pin: u32,
    /// How `led_pin` is numbered
    pub numbering: PinNumbering,
    /// Blinks or messages before stopping
    pub max_blink_times: u32,
    /// LED on-time in the blink lesson
    pub blink_on: Duration,
    /// LED off-time in the blink lesson
    pub blink_off: Duration,
    /// LED flash when a message is acknowledged or a blink command arrives
    pub ack_blink: Duration,
    /// Minimum gap between telemetry messages
    pub send_interval: Duration,
    /// Sleep between work-loop iterations
    pub work_interval: Duration,
    /// Give up waiting for a telemetry ack after this long
    pub ack_timeout: Duration,
    /// Minimum gap between HTTP polls for cloud-to-device messages
    pub min_polling_time: Duration,
    /// Directory holding `<device>-cert.pem` and `<device>-key.pem`
    pub certificate_dir: PathBuf,
    /// PEM bundle of CAs the hub certificate must chain to
    pub trusted_certs: Option<PathBuf>,
}

impl Default for LessonConfig {
    fn default() -> Self {
        Self {
            led_pin: DEFAULT_LED_PIN,
            numbering: PinNumbering::Arduino,
            max_blink_times: DEFAULT_MAX_BLINK_TIMES,
            blink_on: Duration::from_millis(200),
            blink_off: Duration::from_secs(2),
            ack_blink: Duration::from_millis(100),
            send_interval: Duration::from_secs(2),
            work_interval: Duration::from_millis(100),
            ack_timeout: Duration::from_secs(60),
            min_polling_time: Duration::from_secs(1),
            certificate_dir: PathBuf::from("."),
            trusted_certs: None,
        }
    }
}

impl LessonConfig {
    /// Configuration with the stock lesson defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the LED pin
    pub fn led_pin(mut self, pin: u32) -> Self {
        self.led_pin = pin;
        self
    }

    /// Set how the LED pin is numbered
    pub fn numbering(mut self, numbering: PinNumbering) -> Self {
        self.numbering = numbering;
        self
    }

    /// Set the number of blinks or messages
    pub fn max_blink_times(mut self, times: u32) -> Self {
        self.max_blink_times = times;
        self
    }

    /// Set the blink lesson's on and off times
    pub fn blink_timing(mut self, on: Duration, off: Duration) -> Self {
        self.blink_on = on;
        self.blink_off = off;
        self
    }

    /// Set the acknowledgement flash length
    pub fn ack_blink(mut self, duration: Duration) -> Self {
        self.ack_blink = duration;
        self
    }

    /// Set the minimum gap between telemetry messages
    pub fn send_interval(mut self, interval: Duration) -> Self {
        self.send_interval = interval;
        self
    }

    /// Set the work-loop sleep
    pub fn work_interval(mut self, interval: Duration) -> Self {
        self.work_interval = interval;
        self
    }

    /// Set how long to wait for a telemetry ack
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the HTTP polling floor
    pub fn min_polling_time(mut self, interval: Duration) -> Self {
        self.min_polling_time = interval;
        self
    }

    /// Set where device certificates are looked up
    pub fn certificate_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.certificate_dir = dir.into();
        self
    }

    /// Set the trusted CA bundle
    pub fn trusted_certs(mut self, path: impl Into<PathBuf>) -> Self {
        self.trusted_certs = Some(path.into());
        self
    }

    /// Kernel GPIO number for the LED
    pub fn led_gpio(&self) -> DeviceResult<u32> {
        self.numbering.resolve(self.led_pin)
    }

    /// Reject settings the lessons cannot run with
    pub fn validate(&self) -> DeviceResult<()> {
        if self.max_blink_times == 0 {
            return Err(DeviceError::Config("max_blink_times must be at least 1".into()));
        }
        if self.work_interval.is_zero() {
            return Err(DeviceError::Config("work_interval must be non-zero".into()));
        }
        self.led_gpio()?;
        Ok(())
    }
}
