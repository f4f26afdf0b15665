//! LED wiring for the lesson binaries
//!
//! On the board the LED is a sysfs GPIO. With `--dry-run` the lessons run
//! anywhere against an in-memory pin, which is handy for trying the hub side
//! from a workstation.

use edison_core::{DeviceResult, LessonConfig, Led, MockPin, OutputPin, SysfsPin};

/// Pin backing the lesson LED
pub enum BoardPin {
    /// Real GPIO
    Sysfs(SysfsPin),
    /// No hardware; writes are only recorded
    DryRun(MockPin),
}

impl OutputPin for BoardPin {
    fn write(&mut self, high: bool) -> DeviceResult<()> {
        match self {
            Self::Sysfs(pin) => pin.write(high),
            Self::DryRun(pin) => {
                log::debug!("LED {}", if high { "on" } else { "off" });
                pin.write(high)
            }
        }
    }
}

/// Open the configured LED, switched off
pub fn open_led(config: &LessonConfig, dry_run: bool) -> DeviceResult<Led<BoardPin>> {
    let pin = if dry_run {
        BoardPin::DryRun(MockPin::new())
    } else {
        let gpio = config.led_gpio()?;
        log::debug!("LED pin {} is GPIO {gpio}", config.led_pin);
        BoardPin::Sysfs(SysfsPin::open(gpio)?)
    };
    Led::new(pin)
}
