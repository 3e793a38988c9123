// PulseWatch — Cloud Transport Interface
//
// The connection manager talks to the cloud only through these traits.  The
// client is a "low level" handle in the IoT Hub sense: nothing happens on the
// wire until `do_work` is called, and everything the service sends back
// (connection status, twin documents, delivery confirmations) is queued as a
// `ClientEvent` for the caller to drain.

use std::time::Duration;

use thiserror::Error;

use crate::events::ClientEvent;

pub mod azure;
#[cfg(target_os = "espidf")]
pub mod esp;
pub mod sim;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    #[error("invalid provisioning parameter")]
    InvalidParam,
    #[error("network not ready")]
    NetworkNotReady,
    #[error("device authentication not ready")]
    DeviceAuthNotReady,
    #[error("provisioning service rejected the device: {0}")]
    DeviceError(String),
    #[error("provisioning timed out")]
    Timeout,
    #[error("no client handle available")]
    ResourceExhausted,
    #[error("provisioning failed: {0}")]
    Generic(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("client rejected option {0}")]
    Option(&'static str),
    #[error("client refused the message: {0}")]
    Refused(String),
    #[error("client is closed")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("network state unavailable: {0}")]
pub struct NetworkError(pub String);

/// Reachability of the network the cloud sits behind.
pub trait NetworkStatus {
    fn is_ready(&mut self) -> Result<bool, NetworkError>;
}

/// Obtains an authenticated client handle for the device.
pub trait Provisioner {
    type Client: IotClient;

    fn provision(&mut self, scope_id: &str, timeout: Duration) -> Result<Self::Client, ProvisioningError>;
}

pub trait IotClient {
    fn set_keep_alive(&mut self, period: Duration) -> Result<(), ClientError>;

    /// Queue a device-to-cloud message; delivery is confirmed later through
    /// `ClientEvent::SendConfirmed`.
    fn send_event(&mut self, message: &str) -> Result<(), ClientError>;

    /// Queue a reported-properties patch; acknowledged through
    /// `ClientEvent::ReportedStateAck`.
    fn send_reported_state(&mut self, document: &str) -> Result<(), ClientError>;

    /// Move queued traffic in both directions.  Never blocks.
    fn do_work(&mut self);

    fn poll_event(&mut self) -> Option<ClientEvent>;
}
