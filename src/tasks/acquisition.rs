// PulseWatch — Measurement Run
//
// Triggered by button B.  Blocks the caller for the whole run:
//   1. Wake and configure the sensor.
//   2. Until the run time is up: fill a 4 s window sample by sample (each one
//      gated on the INT line), estimate, keep the result if both the heart
//      rate and SpO2 are valid.
//   3. Send the averages as two telemetry messages, if any window was kept.
//   4. Power the sensor down, whatever happened.

use std::time::{Duration, Instant};

use thiserror::Error;

use super::telemetry::{send_telemetry, KEY_HEART_RATE, KEY_SPO2};
use super::Transport;
use crate::config::{ACQUISITION_RUN_TIME, SAMPLE_READY_TIMEOUT, SAMPLE_WINDOW_LEN};
use crate::drivers::{PpgSensor, SensorError};
use crate::events::{Measurement, PpgSample};
use crate::spo2::{Estimate, SignalProcessor};
use crate::time::Clock;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("measurement aborted: {0}")]
    Sensor(#[from] SensorError),
}

/// Paired red/IR buffers for one estimation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleWindow {
    red: Vec<u32>,
    ir: Vec<u32>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            red: Vec::with_capacity(capacity),
            ir: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: PpgSample) {
        if !self.is_full() {
            self.red.push(sample.red);
            self.ir.push(sample.ir);
        }
    }

    pub fn is_full(&self) -> bool {
        self.ir.len() >= self.capacity
    }

    pub fn red(&self) -> &[u32] {
        &self.red
    }

    pub fn ir(&self) -> &[u32] {
        &self.ir
    }
}

/// Running sums over the windows of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Accumulator {
    heart_rate_sum: i64,
    spo2_sum: f64,
    count: u32,
}

impl Accumulator {
    /// Fold in an estimate; only fully valid ones count.
    pub fn add(&mut self, estimate: &Estimate) -> bool {
        if !estimate.is_valid() {
            return false;
        }
        self.heart_rate_sum += i64::from(estimate.heart_rate);
        self.spo2_sum += f64::from(estimate.spo2);
        self.count += 1;
        true
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn mean(&self) -> Option<Measurement> {
        if self.count == 0 {
            return None;
        }
        let n = f64::from(self.count);
        Some(Measurement {
            heart_rate: (self.heart_rate_sum as f64 / n).round() as i32,
            spo2: (self.spo2_sum / n) as f32,
            readings: self.count,
        })
    }
}

pub struct AcquisitionPipeline {
    processor: Box<dyn SignalProcessor>,
    clock: Box<dyn Clock>,
    run_time: Duration,
    window_len: usize,
    ready_timeout: Duration,
}

impl AcquisitionPipeline {
    pub fn new(processor: impl SignalProcessor + 'static, clock: impl Clock + 'static) -> Self {
        Self {
            processor: Box::new(processor),
            clock: Box::new(clock),
            run_time: ACQUISITION_RUN_TIME,
            window_len: SAMPLE_WINDOW_LEN,
            ready_timeout: SAMPLE_READY_TIMEOUT,
        }
    }

    pub fn with_run_time(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    /// One complete measurement run.  `Ok(None)` means no window was usable
    /// and nothing was sent.
    pub fn run(
        &mut self,
        sensor: &mut impl PpgSensor,
        transport: &mut impl Transport,
    ) -> Result<Option<Measurement>, AcquisitionError> {
        let result = self.measure(sensor);
        if let Err(e) = sensor.shutdown() {
            log::warn!("sensor shutdown failed: {}", e);
        }
        let measurement = result?;

        match &measurement {
            Some(m) => {
                log::info!(
                    "average SpO2 = {:.2}%, average heart rate = {} bpm ({} readings)",
                    m.spo2,
                    m.heart_rate,
                    m.readings
                );
                for (key, value) in [(KEY_HEART_RATE, m.heart_rate_string()), (KEY_SPO2, m.spo2_string())] {
                    if let Err(e) = send_telemetry(transport, key, &value) {
                        log::warn!("failed to send {}: {}", key, e);
                    }
                }
            }
            None => log::info!("no valid readings, nothing sent"),
        }
        Ok(measurement)
    }

    fn measure(&mut self, sensor: &mut impl PpgSensor) -> Result<Option<Measurement>, SensorError> {
        sensor.init()?;
        log::info!(
            "running measurement for {} seconds, place your finger on the sensor",
            self.run_time.as_secs()
        );

        let mut accumulator = Accumulator::default();
        let start = self.clock.now();
        while self.clock.now().saturating_duration_since(start) < self.run_time {
            let window = self.fill_window(sensor)?;
            let estimate = self.processor.estimate(window.ir(), window.red());
            if accumulator.add(&estimate) {
                log::info!(
                    "SpO2 = {:.2}% [normal is 95-100%], heart rate = {} bpm",
                    estimate.spo2,
                    estimate.heart_rate
                );
            } else {
                log::debug!(
                    "window discarded: hr_valid={} spo2_valid={}",
                    estimate.heart_rate_valid,
                    estimate.spo2_valid
                );
            }
        }
        Ok(accumulator.mean())
    }

    fn fill_window(&mut self, sensor: &mut impl PpgSensor) -> Result<SampleWindow, SensorError> {
        let mut window = SampleWindow::new(self.window_len);
        while !window.is_full() {
            self.wait_ready(sensor)?;
            window.push(sensor.read_sample()?);
        }
        Ok(window)
    }

    fn wait_ready(&self, sensor: &mut impl PpgSensor) -> Result<(), SensorError> {
        let deadline: Instant = self.clock.now() + self.ready_timeout;
        loop {
            if sensor.is_sample_ready()? {
                return Ok(());
            }
            if self.clock.now() >= deadline {
                return Err(SensorError::ReadyTimeout);
            }
            std::hint::spin_loop();
        }
    }
}
