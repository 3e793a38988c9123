// PulseWatch — MAX30102 Pulse Oximeter Driver
//
// Register-level driver for the Maxim MAX30102 on the Heart Rate 4 click.
// Runs in SpO2 mode (red + IR), 4-sample on-chip averaging, 100 sps → 25
// samples/s into the FIFO.  The INT line goes LOW when a new sample is waiting.

use embedded_hal::digital::{Error as _, InputPin};
use embedded_hal::i2c::{Error as _, I2c};

use super::{PpgSensor, SensorError};
use crate::config::I2C_ADDR_MAX30102;
use crate::events::{PpgSample, SensorInfo};

// MAX30102 register addresses
pub const REG_INTR_STATUS_1: u8 = 0x00;
pub const REG_INTR_STATUS_2: u8 = 0x01;
pub const REG_INTR_ENABLE_1: u8 = 0x02;
pub const REG_INTR_ENABLE_2: u8 = 0x03;
pub const REG_FIFO_WR_PTR: u8 = 0x04;
pub const REG_OVF_COUNTER: u8 = 0x05;
pub const REG_FIFO_RD_PTR: u8 = 0x06;
pub const REG_FIFO_DATA: u8 = 0x07;
pub const REG_FIFO_CONFIG: u8 = 0x08;
pub const REG_MODE_CONFIG: u8 = 0x09;
pub const REG_SPO2_CONFIG: u8 = 0x0A;
pub const REG_LED1_PA: u8 = 0x0C;
pub const REG_LED2_PA: u8 = 0x0D;
pub const REG_PILOT_PA: u8 = 0x10;
pub const REG_REV_ID: u8 = 0xFE;
pub const REG_PART_ID: u8 = 0xFF;

pub const PART_ID_EXPECTED: u8 = 0x15;

pub const MODE_SHUTDOWN: u8 = 0x80;
pub const MODE_RESET: u8 = 0x40;
pub const MODE_SPO2: u8 = 0x03;

const SAMPLE_MASK: u32 = 0x0003_FFFF; // 18-bit ADC
const RESET_POLL_LIMIT: usize = 100;

/// Power-on configuration, written in order after a reset.
const INIT_SEQUENCE: [(u8, u8); 10] = [
    (REG_INTR_ENABLE_1, 0xC0), // A_FULL + PPG_RDY
    (REG_INTR_ENABLE_2, 0x00),
    (REG_FIFO_WR_PTR, 0x00),
    (REG_OVF_COUNTER, 0x00),
    (REG_FIFO_RD_PTR, 0x00),
    (REG_FIFO_CONFIG, 0x4F),   // avg 4, rollover off, almost-full at 17
    (REG_MODE_CONFIG, MODE_SPO2),
    (REG_SPO2_CONFIG, 0x27),   // 4096 nA range, 100 sps, 411 µs pulse
    (REG_LED1_PA, 0x24),       // ~7 mA
    (REG_LED2_PA, 0x24),
];

pub struct Max30102<I2C, INT> {
    i2c: I2C,
    int: INT,
    address: u8,
}

impl<I2C: I2c, INT: InputPin> Max30102<I2C, INT> {
    pub fn new(i2c: I2C, int: INT) -> Self {
        Self {
            i2c,
            int,
            address: I2C_ADDR_MAX30102,
        }
    }

    /// Give the bus and interrupt pin back.
    pub fn release(self) -> (I2C, INT) {
        (self.i2c, self.int)
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), SensorError> {
        self.i2c
            .write(self.address, &[reg, value])
            .map_err(|e| SensorError::Bus(e.kind()))
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8, SensorError> {
        let mut buf = [0u8; 1];
        self.i2c
            .write_read(self.address, &[reg], &mut buf)
            .map_err(|e| SensorError::Bus(e.kind()))?;
        Ok(buf[0])
    }

    fn reset(&mut self) -> Result<(), SensorError> {
        self.write_reg(REG_MODE_CONFIG, MODE_RESET)?;
        for _ in 0..RESET_POLL_LIMIT {
            if self.read_reg(REG_MODE_CONFIG)? & MODE_RESET == 0 {
                return Ok(());
            }
        }
        Err(SensorError::ResetTimeout)
    }
}

impl<I2C: I2c, INT: InputPin> PpgSensor for Max30102<I2C, INT> {
    fn init(&mut self) -> Result<(), SensorError> {
        self.reset()?;
        // Reading the status register clears a stale power-ready interrupt.
        self.read_reg(REG_INTR_STATUS_1)?;
        for (reg, value) in INIT_SEQUENCE {
            self.write_reg(reg, value)?;
        }
        self.write_reg(REG_PILOT_PA, 0x7F)?;
        log::debug!("MAX30102 initialised (SpO2 mode, 25 sps)");
        Ok(())
    }

    fn info(&mut self) -> Result<SensorInfo, SensorError> {
        Ok(SensorInfo {
            revision: self.read_reg(REG_REV_ID)?,
            part_id: self.read_reg(REG_PART_ID)?,
        })
    }

    fn is_sample_ready(&mut self) -> Result<bool, SensorError> {
        // Open drain, active LOW.
        self.int.is_low().map_err(|e| SensorError::Pin(e.kind()))
    }

    fn read_sample(&mut self) -> Result<PpgSample, SensorError> {
        self.read_reg(REG_INTR_STATUS_1)?;
        self.read_reg(REG_INTR_STATUS_2)?;

        let mut raw = [0u8; 6];
        self.i2c
            .write_read(self.address, &[REG_FIFO_DATA], &mut raw)
            .map_err(|e| SensorError::Bus(e.kind()))?;

        let word = |b: &[u8]| u32::from_be_bytes([0, b[0], b[1], b[2]]) & SAMPLE_MASK;
        Ok(PpgSample {
            red: word(&raw[0..3]),
            ir: word(&raw[3..6]),
        })
    }

    fn shutdown(&mut self) -> Result<(), SensorError> {
        let mode = self.read_reg(REG_MODE_CONFIG)?;
        self.write_reg(REG_MODE_CONFIG, mode | MODE_SHUTDOWN)
    }
}
