// PulseWatch — Simulated MAX30102
//
// Register model of the pulse oximeter for running the firmware on a
// development host.  The FIFO produces a synthetic 72 bpm pulse at 25 samples/s
// and the INT line is paced by a `Clock`, so the driver sees the same
// "wait for LOW, then read" rhythm as on hardware.

use std::cell::RefCell;
use std::f64::consts::TAU;
use std::rc::Rc;
use std::time::{Duration, Instant};

use embedded_hal::digital::{self, InputPin};
use embedded_hal::i2c::{self, I2c, NoAcknowledgeSource, Operation};

use crate::config::{I2C_ADDR_MAX30102, SAMPLE_RATE_HZ};
use crate::drivers::max30102::{
    MODE_RESET, MODE_SHUTDOWN, MODE_SPO2, PART_ID_EXPECTED, REG_FIFO_DATA, REG_MODE_CONFIG, REG_PART_ID,
    REG_REV_ID,
};
use crate::time::Clock;

const REVISION: u8 = 0x03;
const PULSE_HZ: f64 = 1.2; // 72 bpm

// (DC, AC amplitude) per channel; ratio-of-ratios 0.5 → SpO2 ≈ 98.8 %
const IR_LEVEL: (f64, f64) = (100_000.0, 1_500.0);
const RED_LEVEL: (f64, f64) = (60_000.0, 450.0);
const NO_FINGER_LEVEL: f64 = 4_000.0;

struct Model {
    clock: Box<dyn Clock>,
    regs: [u8; 256],
    pointer: u8,
    next_due: Option<Instant>,
    sample_index: u64,
    finger: bool,
}

impl Model {
    fn period() -> Duration {
        Duration::from_secs(1) / SAMPLE_RATE_HZ as u32
    }

    fn reset(&mut self) {
        self.regs = [0; 256];
        self.regs[REG_REV_ID as usize] = REVISION;
        self.regs[REG_PART_ID as usize] = PART_ID_EXPECTED;
        self.next_due = None;
    }

    fn write(&mut self, bytes: &[u8]) {
        let Some((&reg, values)) = bytes.split_first() else {
            return;
        };
        self.pointer = reg;
        for &value in values {
            self.store(self.pointer, value);
            self.pointer = self.pointer.wrapping_add(1);
        }
    }

    fn store(&mut self, reg: u8, value: u8) {
        if reg == REG_REV_ID || reg == REG_PART_ID {
            return;
        }
        if reg != REG_MODE_CONFIG {
            self.regs[reg as usize] = value;
            return;
        }
        if value & MODE_RESET != 0 {
            self.reset();
            return;
        }
        self.regs[reg as usize] = value;
        if value & MODE_SHUTDOWN != 0 || value & 0x07 != MODE_SPO2 {
            self.next_due = None;
        } else if self.next_due.is_none() {
            self.next_due = Some(self.clock.now() + Self::period());
        }
    }

    fn read(&mut self, buf: &mut [u8]) {
        if self.pointer == REG_FIFO_DATA {
            let (red, ir) = self.next_sample();
            let mut bytes = [0u8; 6];
            bytes[..3].copy_from_slice(&red.to_be_bytes()[1..]);
            bytes[3..].copy_from_slice(&ir.to_be_bytes()[1..]);
            for (slot, byte) in buf.iter_mut().zip(bytes.iter().cycle()) {
                *slot = *byte;
            }
            return;
        }
        for slot in buf.iter_mut() {
            *slot = self.regs[self.pointer as usize];
            self.pointer = self.pointer.wrapping_add(1);
        }
    }

    fn next_sample(&mut self) -> (u32, u32) {
        let t = self.sample_index as f64 / SAMPLE_RATE_HZ as f64;
        self.sample_index += 1;
        if let Some(due) = self.next_due.as_mut() {
            *due += Self::period();
        }

        let wave = (TAU * PULSE_HZ * t).sin();
        if !self.finger {
            let level = NO_FINGER_LEVEL as u32;
            return (level, level);
        }
        let red = RED_LEVEL.0 + RED_LEVEL.1 * wave;
        let ir = IR_LEVEL.0 + IR_LEVEL.1 * wave;
        (red.round() as u32, ir.round() as u32)
    }

    fn int_low(&self) -> bool {
        self.next_due.is_some_and(|due| self.clock.now() >= due)
    }
}

/// Handle to the shared sensor model; hands out the bus and INT pin.
#[derive(Clone)]
pub struct SimulatedMax30102(Rc<RefCell<Model>>);

impl SimulatedMax30102 {
    pub fn new(clock: impl Clock + 'static) -> Self {
        let mut model = Model {
            clock: Box::new(clock),
            regs: [0; 256],
            pointer: 0,
            next_due: None,
            sample_index: 0,
            finger: true,
        };
        model.reset();
        Self(Rc::new(RefCell::new(model)))
    }

    pub fn bus(&self) -> SimBus {
        SimBus(Rc::clone(&self.0))
    }

    pub fn int_pin(&self) -> SimIntPin {
        SimIntPin(Rc::clone(&self.0))
    }

    /// Take the finger off (or put it back on) the sensor.
    pub fn set_finger(&self, present: bool) {
        self.0.borrow_mut().finger = present;
    }

    pub fn register(&self, reg: u8) -> u8 {
        self.0.borrow().regs[reg as usize]
    }
}

pub struct SimBus(Rc<RefCell<Model>>);

impl i2c::ErrorType for SimBus {
    type Error = i2c::ErrorKind;
}

impl I2c for SimBus {
    fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        if address != I2C_ADDR_MAX30102 {
            return Err(i2c::ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }
        let mut model = self.0.borrow_mut();
        for operation in operations {
            match operation {
                Operation::Write(bytes) => model.write(bytes),
                Operation::Read(buf) => model.read(buf),
            }
        }
        Ok(())
    }
}

pub struct SimIntPin(Rc<RefCell<Model>>);

impl digital::ErrorType for SimIntPin {
    type Error = digital::ErrorKind;
}

impl InputPin for SimIntPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.0.borrow().int_low())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.0.borrow().int_low())
    }
}
