// PulseWatch — Hardware & System Configuration
// Target: Seeed Studio Xiao ESP32-C3 (RISC-V) + MikroE Heart Rate 4 click (MAX30102)

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// GPIO Pin Definitions (Xiao ESP32-C3 pinout)
// ---------------------------------------------------------------------------
pub const PIN_BUTTON_HEARTBEAT: i32 = 3; // D1/A1 — Button A (INPUT_PULLUP, active LOW)
pub const PIN_BUTTON_MEASURE: i32 = 5;   // D3    — Button B (INPUT_PULLUP, active LOW)
pub const PIN_STATUS_LED: i32 = 4;       // D2/A2 — Twin status LED (active LOW)
pub const PIN_SENSOR_INT: i32 = 2;       // D0/A0 — MAX30102 INT (open drain, active LOW)
pub const PIN_I2C_SDA: i32 = 6;          // D4    — I2C data line
pub const PIN_I2C_SCL: i32 = 7;          // D5    — I2C clock line

// ---------------------------------------------------------------------------
// I2C Bus
// ---------------------------------------------------------------------------
pub const I2C_ADDR_MAX30102: u8 = 0x57;
pub const I2C_BAUDRATE_KHZ: u32 = 100; // standard mode

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------
pub const SAMPLE_RATE_HZ: usize = 25;                         // after 4x on-chip averaging
pub const SAMPLE_WINDOW_SECONDS: usize = 4;
pub const SAMPLE_WINDOW_LEN: usize = SAMPLE_RATE_HZ * SAMPLE_WINDOW_SECONDS; // 100
pub const ACQUISITION_RUN_TIME: Duration = Duration::from_secs(6);
pub const SAMPLE_READY_TIMEOUT: Duration = Duration::from_secs(1);
pub const FINGER_PRESENCE_THRESHOLD: u32 = 32_000;           // IR DC level with a finger on

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------
pub const BUTTON_POLL_PERIOD: Duration = Duration::from_millis(1);
pub const DISPATCH_WAIT_SLICE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Cloud connection (periods in seconds)
// ---------------------------------------------------------------------------
pub const CLOUD_DEFAULT_POLL_SECS: u32 = 20;
pub const CLOUD_MIN_RECONNECT_SECS: u32 = 10;
pub const CLOUD_MAX_RECONNECT_SECS: u32 = 10 * 60;
pub const CLOUD_KEEP_ALIVE: Duration = Duration::from_secs(20);
pub const PROVISIONING_TIMEOUT: Duration = Duration::from_millis(10_000);

// ---------------------------------------------------------------------------
// Payload limits
// ---------------------------------------------------------------------------
pub const SCOPE_ID_MAX_LEN: usize = 20;
pub const NPR_ID_MAX_LEN: usize = 11;      // bytes
pub const TELEMETRY_MAX_LEN: usize = 100;
pub const REPORTED_STATE_MAX_LEN: usize = 40;

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("scope id must be supplied as the only argument")]
    MissingScopeId,
    #[error("expected exactly one argument, got {0}")]
    UnexpectedArguments(usize),
    #[error("scope id is empty")]
    EmptyScopeId,
    #[error("scope id is {len} characters, at most {max} are supported")]
    ScopeIdTooLong { len: usize, max: usize },
}

/// Settings supplied at startup rather than compiled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub scope_id: String,
}

impl AppConfig {
    /// Build the configuration from the process arguments (program name excluded).
    pub fn from_args<I>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        match args.as_slice() {
            [] => Err(ConfigError::MissingScopeId),
            [scope_id] => Self::with_scope_id(scope_id),
            more => Err(ConfigError::UnexpectedArguments(more.len())),
        }
    }

    pub fn with_scope_id(scope_id: &str) -> Result<Self, ConfigError> {
        let scope_id = scope_id.trim();
        if scope_id.is_empty() {
            return Err(ConfigError::EmptyScopeId);
        }
        let len = scope_id.chars().count();
        if len > SCOPE_ID_MAX_LEN {
            return Err(ConfigError::ScopeIdTooLong { len, max: SCOPE_ID_MAX_LEN });
        }
        Ok(Self { scope_id: scope_id.to_owned() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_argument_becomes_scope_id() {
        let config = AppConfig::from_args(["ABC123"]).unwrap();
        assert_eq!(config.scope_id, "ABC123");
    }

    #[test]
    fn missing_scope_id_is_rejected() {
        let none: [&str; 0] = [];
        assert_eq!(AppConfig::from_args(none), Err(ConfigError::MissingScopeId));
    }

    #[test]
    fn extra_arguments_are_rejected() {
        assert_eq!(
            AppConfig::from_args(["ABC123", "extra"]),
            Err(ConfigError::UnexpectedArguments(2))
        );
    }

    #[test]
    fn scope_id_length_is_bounded() {
        assert_eq!(AppConfig::from_args(["   "]), Err(ConfigError::EmptyScopeId));
        let long = "0ne00000000000000000X";
        assert_eq!(
            AppConfig::from_args([long]),
            Err(ConfigError::ScopeIdTooLong { len: 21, max: SCOPE_ID_MAX_LEN })
        );
    }

    #[test]
    fn window_covers_four_seconds_of_samples() {
        assert_eq!(SAMPLE_WINDOW_LEN, 100);
    }
}
