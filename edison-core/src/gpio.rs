//! GPIO output and LED control
//!
//! ## Overview
//!
//! The lessons only ever drive one output: the LED on header pin 13 of the
//! Edison Arduino breakout. Pins are numbered two ways:
//!
//! - **Arduino**: the `IO0`..`IO13` labels printed on the breakout board
//! - **Linux**: the kernel GPIO number exported under `/sys/class/gpio`
//!
//! [`PinNumbering`] turns the first into the second. Pin multiplexing on the
//! breakout (level shifters, output enables) is expected to be set up by the
//! board image; only the final GPIO is driven here.
//!
//! ## Implementations
//!
//! - [`SysfsPin`]: real hardware through the sysfs interface
//! - [`MockPin`]: records every level written, for tests and dry runs

use std::sync::{Arc, Mutex, PoisonError};

use crate::errors::{DeviceError, DeviceResult};

/// Anything that can be driven high or low
pub trait OutputPin {
    /// Drive the pin to the given level
    fn write(&mut self, high: bool) -> DeviceResult<()>;
}

/// Arduino header pin to Edison kernel GPIO, indexed by `IO` number
const EDISON_ARDUINO_GPIO: [u32; 14] = [
    130, // IO0
    131, // IO1
    128, // IO2
    12,  // IO3
    129, // IO4
    13,  // IO5
    182, // IO6
    48,  // IO7
    49,  // IO8
    183, // IO9
    41,  // IO10
    43,  // IO11
    42,  // IO12
    40,  // IO13
];

/// Kernel GPIO behind an Arduino breakout header pin
pub fn edison_arduino_gpio(pin: u32) -> Option<u32> {
    EDISON_ARDUINO_GPIO.get(pin as usize).copied()
}

/// How a configured pin number should be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinNumbering {
    /// Header labels on the Arduino breakout
    #[default]
    Arduino,
    /// Raw kernel GPIO numbers
    Linux,
}

impl PinNumbering {
    /// Resolve a configured pin to a kernel GPIO number
    pub fn resolve(self, pin: u32) -> DeviceResult<u32> {
        match self {
            Self::Arduino => edison_arduino_gpio(pin).ok_or(DeviceError::UnmappedPin { pin }),
            Self::Linux => Ok(pin),
        }
    }
}

impl std::str::FromStr for PinNumbering {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "arduino" => Ok(Self::Arduino),
            "linux" | "raw" => Ok(Self::Linux),
            other => Err(DeviceError::Config(format!("unknown pin numbering '{other}'"))),
        }
    }
}

/// Output pin driven through `/sys/class/gpio`
#[cfg(feature = "sysfs")]
pub struct SysfsPin {
    number: u32,
    inner: ::gpio::sysfs::SysFsGpioOutput,
}

#[cfg(feature = "sysfs")]
impl SysfsPin {
    /// Export the kernel GPIO and configure it as an output
    pub fn open(number: u32) -> DeviceResult<Self> {
        let gpio_number = u16::try_from(number).map_err(|_| DeviceError::Gpio {
            pin: number,
            reason: "GPIO number out of range".into(),
        })?;
        let inner = ::gpio::sysfs::SysFsGpioOutput::open(gpio_number).map_err(|e| DeviceError::Gpio {
            pin: number,
            reason: e.to_string(),
        })?;
        log::debug!("Exported GPIO {number} as output");
        Ok(Self { number, inner })
    }

    /// Kernel GPIO number
    pub fn number(&self) -> u32 {
        self.number
    }
}

#[cfg(feature = "sysfs")]
impl OutputPin for SysfsPin {
    fn write(&mut self, high: bool) -> DeviceResult<()> {
        use ::gpio::GpioOut;

        self.inner.set_value(high).map_err(|e| DeviceError::Gpio {
            pin: self.number,
            reason: e.to_string(),
        })
    }
}

/// In-memory pin that records every write
///
/// Clones share the same history, so a test can keep one handle and give
/// the other to the code under test.
#[derive(Debug, Clone, Default)]
pub struct MockPin {
    writes: Arc<Mutex<Vec<bool>>>,
}

impl MockPin {
    /// Create a pin with an empty history
    pub fn new() -> Self {
        Self::default()
    }

    /// Every level written so far, oldest first
    pub fn writes(&self) -> Vec<bool> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Number of low-to-high transitions seen
    pub fn pulses(&self) -> usize {
        let writes = self.writes();
        let mut previous = false;
        let mut count = 0;
        for level in writes {
            if level && !previous {
                count += 1;
            }
            previous = level;
        }
        count
    }
}

impl OutputPin for MockPin {
    fn write(&mut self, high: bool) -> DeviceResult<()> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(high);
        Ok(())
    }
}

/// An LED on an output pin
pub struct Led<P: OutputPin> {
    pin: P,
    lit: bool,
}

impl<P: OutputPin> Led<P> {
    /// Wrap a pin, driving it low so the LED starts dark
    pub fn new(mut pin: P) -> DeviceResult<Self> {
        pin.write(false)?;
        Ok(Self { pin, lit: false })
    }

    /// Light the LED
    pub fn on(&mut self) -> DeviceResult<()> {
        self.set(true)
    }

    /// Turn the LED off
    pub fn off(&mut self) -> DeviceResult<()> {
        self.set(false)
    }

    /// Drive the LED to a level
    pub fn set(&mut self, lit: bool) -> DeviceResult<()> {
        self.pin.write(lit)?;
        self.lit = lit;
        Ok(())
    }

    /// Last level written
    pub fn is_lit(&self) -> bool {
        self.lit
    }

    /// Give the pin back
    pub fn into_inner(self) -> P {
        self.pin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn led_starts_dark() {
        let pin = MockPin::new();
        let led = Led::new(pin.clone()).unwrap();
        assert!(!led.is_lit());
        assert_eq!(pin.writes(), vec![false]);
    }

    #[test]
    fn led_tracks_level() {
        let pin = MockPin::new();
        let mut led = Led::new(pin.clone()).unwrap();
        led.on().unwrap();
        assert!(led.is_lit());
        led.off().unwrap();
        assert!(!led.is_lit());
        assert_eq!(pin.writes(), vec![false, true, false]);
        assert_eq!(pin.pulses(), 1);
    }

    #[test]
    fn led_pin_thirteen_maps_to_gpio_forty() {
        assert_eq!(PinNumbering::Arduino.resolve(13).unwrap(), 40);
        assert_eq!(PinNumbering::Arduino.resolve(2).unwrap(), 128);
    }

    #[test]
    fn unmapped_header_pin() {
        let err = PinNumbering::Arduino.resolve(14).unwrap_err();
        assert!(matches!(err, DeviceError::UnmappedPin { pin: 14 }));
    }

    #[test]
    fn linux_numbering_passes_through() {
        assert_eq!(PinNumbering::Linux.resolve(183).unwrap(), 183);
    }

    #[test]
    fn numbering_from_str() {
        assert_eq!("Arduino".parse::<PinNumbering>().unwrap(), PinNumbering::Arduino);
        assert_eq!("raw".parse::<PinNumbering>().unwrap(), PinNumbering::Linux);
        assert!("bcm".parse::<PinNumbering>().is_err());
    }
}
