// PulseWatch — Status LED Driver
//
// Single GPIO-driven LED, wired active LOW: driving the pin low lights it.

use embedded_hal::digital::{Error as _, ErrorKind, OutputPin};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("could not drive status LED: {0:?}")]
pub struct LedError(pub ErrorKind);

pub struct StatusLed<P> {
    pin: P,
    on: bool,
}

impl<P: OutputPin> StatusLed<P> {
    /// Take the pin and make sure the LED starts dark.
    pub fn new(pin: P) -> Result<Self, LedError> {
        let mut led = Self { pin, on: true };
        led.set(false)?;
        Ok(led)
    }

    pub fn set(&mut self, on: bool) -> Result<(), LedError> {
        let result = if on { self.pin.set_low() } else { self.pin.set_high() };
        result.map_err(|e| LedError(e.kind()))?;
        self.on = on;
        Ok(())
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPin;

    #[test]
    fn starts_dark_and_drives_active_low() {
        let pin = RecordingPin::new();
        let mut led = StatusLed::new(pin.clone()).unwrap();
        assert!(!led.is_on());
        led.set(true).unwrap();
        assert!(led.is_on());
        led.set(false).unwrap();
        // high = off, low = on
        assert_eq!(pin.history(), [true, false, true]);
    }

    #[test]
    fn failed_write_keeps_previous_state() {
        let pin = RecordingPin::new();
        let mut led = StatusLed::new(pin.clone()).unwrap();
        pin.fail_writes(true);
        assert!(led.set(true).is_err());
        assert!(!led.is_on());
    }
}
