// PulseWatch — Button Input
//
// Edge-triggered button polling.  Buttons are wired with pull-ups, so the idle
// level is HIGH and a press pulls the line LOW.  A press fires once on the
// HIGH → LOW transition; holding the button does not re-trigger.

use embedded_hal::digital::{Error as _, ErrorKind, InputPin};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    High,
    Low,
}

impl Level {
    pub fn from_high(is_high: bool) -> Self {
        if is_high {
            Self::High
        } else {
            Self::Low
        }
    }
}

/// Last observed level of one button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeDetector {
    last: Level,
}

impl Default for EdgeDetector {
    fn default() -> Self {
        Self { last: Level::High } // pull-up → idle HIGH
    }
}

impl EdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new level; returns `true` exactly on a HIGH → LOW transition.
    pub fn update(&mut self, level: Level) -> bool {
        let pressed = level == Level::Low && self.last != Level::Low;
        self.last = level;
        pressed
    }

    pub fn last(&self) -> Level {
        self.last
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("could not read button {name}: {kind:?}")]
pub struct ButtonError {
    pub name: &'static str,
    pub kind: ErrorKind,
}

pub struct Button<P> {
    name: &'static str,
    pin: P,
    edge: EdgeDetector,
}

impl<P: InputPin> Button<P> {
    pub fn new(name: &'static str, pin: P) -> Self {
        Self {
            name,
            pin,
            edge: EdgeDetector::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Sample the pin once; `Ok(true)` when the button was just pressed.
    pub fn poll(&mut self) -> Result<bool, ButtonError> {
        let high = self.pin.is_high().map_err(|e| ButtonError {
            name: self.name,
            kind: e.kind(),
        })?;
        Ok(self.edge.update(Level::from_high(high)))
    }
}
