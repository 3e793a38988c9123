// PulseWatch — System Events & Data Types

use std::fmt;

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unauthenticated,
    Authenticated,
}

/// Status carried by a connection-status notification from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Authenticated,
    Unauthenticated,
}

/// Why the transport changed connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusReason {
    ExpiredSasToken,
    DeviceDisabled,
    BadCredential,
    RetryExpired,
    NoNetwork,
    CommunicationError,
    Ok,
    Unknown,
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ExpiredSasToken => "expired SAS token",
            Self::DeviceDisabled => "device disabled",
            Self::BadCredential => "bad credential",
            Self::RetryExpired => "retry expired",
            Self::NoNetwork => "no network",
            Self::CommunicationError => "communication error",
            Self::Ok => "ok",
            Self::Unknown => "unknown reason",
        })
    }
}

/// Whether a twin update carries the whole document or only a desired patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinUpdateState {
    Complete,
    Partial,
}

/// Outcome of an asynchronous telemetry send, reported after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ok,
    BecauseDestroy,
    MessageTimeout,
    Error,
}

/// Completions and notifications queued by the cloud client.
///
/// These stand in for the transport's callbacks: the connection manager drains
/// them after each background-work step.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionStatus {
        status: ConnectionStatus,
        reason: StatusReason,
    },
    TwinUpdate {
        state: TwinUpdateState,
        payload: Vec<u8>,
    },
    SendConfirmed(Confirmation),
    ReportedStateAck {
        status: u16,
    },
}

/// What the connection manager hands back to the application after a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The session just became authenticated.
    Authenticated,
    /// A desired-properties document arrived.
    TwinUpdate(Vec<u8>),
}

// ---------------------------------------------------------------------------
// Sensor data
// ---------------------------------------------------------------------------

/// One paired reading from the PPG front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PpgSample {
    pub red: u32,
    pub ir: u32,
}

/// Identification registers read from the sensor at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorInfo {
    pub revision: u8,
    pub part_id: u8,
}

impl SensorInfo {
    pub fn revision_string(&self) -> String {
        format!("0x{:02X}", self.revision)
    }

    pub fn part_id_string(&self) -> String {
        format!("0x{:02X}", self.part_id)
    }
}

/// Averages reported at the end of a measurement run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub heart_rate: i32,
    pub spo2: f32,
    pub readings: u32,
}

impl Measurement {
    pub fn heart_rate_string(&self) -> String {
        self.heart_rate.to_string()
    }

    pub fn spo2_string(&self) -> String {
        format!("{:.2}", self.spo2)
    }
}
