// PulseWatch — Peripheral Drivers

use thiserror::Error;

use crate::events::{PpgSample, SensorInfo};

pub mod led;
pub mod max30102;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("I2C transfer failed: {0:?}")]
    Bus(embedded_hal::i2c::ErrorKind),
    #[error("interrupt line read failed: {0:?}")]
    Pin(embedded_hal::digital::ErrorKind),
    #[error("sensor did not come out of reset")]
    ResetTimeout,
    #[error("no sample became ready in time")]
    ReadyTimeout,
}

/// A two-channel photoplethysmography front end.
pub trait PpgSensor {
    /// Reset and configure for continuous SpO2 sampling.
    fn init(&mut self) -> Result<(), SensorError>;

    fn info(&mut self) -> Result<SensorInfo, SensorError>;

    /// Non-blocking check of the data-ready line.
    fn is_sample_ready(&mut self) -> Result<bool, SensorError>;

    fn read_sample(&mut self) -> Result<PpgSample, SensorError>;

    /// Power down; `init` brings it back.
    fn shutdown(&mut self) -> Result<(), SensorError>;
}
