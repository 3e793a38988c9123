// PulseWatch — Loopback Cloud
//
// Stand-in for the IoT Hub when running off-target.  Provisioning can be told
// to fail a number of times first; once connected the client reports itself
// authenticated, optionally delivers a desired-properties document, and
// confirms every message it is handed.

use std::collections::VecDeque;
use std::time::Duration;

use super::{ClientError, IotClient, NetworkError, NetworkStatus, ProvisioningError, Provisioner};
use crate::events::{ClientEvent, Confirmation, ConnectionStatus, StatusReason, TwinUpdateState};

/// Network that is always up.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl NetworkStatus for AlwaysOnline {
    fn is_ready(&mut self) -> Result<bool, NetworkError> {
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct LoopbackProvisioner {
    failures_left: u32,
    attempts: u32,
    desired: Option<String>,
}

impl LoopbackProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` provisioning attempts.
    pub fn failing(mut self, count: u32) -> Self {
        self.failures_left = count;
        self
    }

    /// Deliver `document` as a full twin update right after connecting.
    pub fn with_desired(mut self, document: impl Into<String>) -> Self {
        self.desired = Some(document.into());
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Provisioner for LoopbackProvisioner {
    type Client = LoopbackClient;

    fn provision(&mut self, scope_id: &str, _timeout: Duration) -> Result<LoopbackClient, ProvisioningError> {
        self.attempts += 1;
        if scope_id.is_empty() {
            return Err(ProvisioningError::InvalidParam);
        }
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(ProvisioningError::DeviceError("loopback refused registration".into()));
        }

        log::info!("loopback: device provisioned in scope {}", scope_id);
        let mut client = LoopbackClient::default();
        client.pending.push_back(ClientEvent::ConnectionStatus {
            status: ConnectionStatus::Authenticated,
            reason: StatusReason::Ok,
        });
        if let Some(document) = &self.desired {
            client.pending.push_back(ClientEvent::TwinUpdate {
                state: TwinUpdateState::Complete,
                payload: document.clone().into_bytes(),
            });
        }
        Ok(client)
    }
}

/// Delivered messages kept per direction; older ones are forgotten.
pub const HISTORY_LEN: usize = 32;

#[derive(Debug, Default)]
pub struct LoopbackClient {
    keep_alive: Option<Duration>,
    outbox: VecDeque<Outbound>,
    pending: VecDeque<ClientEvent>,
    ready: VecDeque<ClientEvent>,
    sent: Vec<String>,
    reported: Vec<String>,
}

#[derive(Debug)]
enum Outbound {
    Event(String),
    Reported(String),
}

impl LoopbackClient {
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    /// The most recent `HISTORY_LEN` delivered telemetry messages, oldest first.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    pub fn reported(&self) -> &[String] {
        &self.reported
    }

    /// Queue an inbound event as if the service had sent it.
    pub fn inject(&mut self, event: ClientEvent) {
        self.pending.push_back(event);
    }
}

impl IotClient for LoopbackClient {
    fn set_keep_alive(&mut self, period: Duration) -> Result<(), ClientError> {
        self.keep_alive = Some(period);
        Ok(())
    }

    fn send_event(&mut self, message: &str) -> Result<(), ClientError> {
        self.outbox.push_back(Outbound::Event(message.to_owned()));
        Ok(())
    }

    fn send_reported_state(&mut self, document: &str) -> Result<(), ClientError> {
        self.outbox.push_back(Outbound::Reported(document.to_owned()));
        Ok(())
    }

    fn do_work(&mut self) {
        while let Some(item) = self.outbox.pop_front() {
            match item {
                Outbound::Event(message) => {
                    log::info!("loopback: telemetry {}", message);
                    remember(&mut self.sent, message);
                    self.ready.push_back(ClientEvent::SendConfirmed(Confirmation::Ok));
                }
                Outbound::Reported(document) => {
                    log::info!("loopback: reported {}", document);
                    remember(&mut self.reported, document);
                    self.ready.push_back(ClientEvent::ReportedStateAck { status: 204 });
                }
            }
        }
        self.ready.extend(self.pending.drain(..));
    }

    fn poll_event(&mut self) -> Option<ClientEvent> {
        self.ready.pop_front()
    }
}

fn remember(history: &mut Vec<String>, item: String) {
    if history.len() == HISTORY_LEN {
        history.remove(0);
    }
    history.push(item);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_fails_the_requested_number_of_times() {
        let mut provisioner = LoopbackProvisioner::new().failing(2);
        assert!(provisioner.provision("ABC123", Duration::from_secs(10)).is_err());
        assert!(provisioner.provision("ABC123", Duration::from_secs(10)).is_err());
        assert!(provisioner.provision("ABC123", Duration::from_secs(10)).is_ok());
        assert_eq!(provisioner.attempts(), 3);
    }

    #[test]
    fn nothing_moves_until_do_work() {
        let mut client = LoopbackProvisioner::new()
            .with_desired(r#"{"desired":{"StatusLED":{"value":true}}}"#)
            .provision("ABC123", Duration::from_secs(10))
            .unwrap();
        client.send_event(r#"{"k":"v"}"#).unwrap();
        assert!(client.poll_event().is_none());
        assert!(client.sent().is_empty());

        client.do_work();
        assert_eq!(client.sent(), [r#"{"k":"v"}"#]);
        assert_eq!(client.poll_event(), Some(ClientEvent::SendConfirmed(Confirmation::Ok)));
        assert!(matches!(
            client.poll_event(),
            Some(ClientEvent::ConnectionStatus { status: ConnectionStatus::Authenticated, .. })
        ));
        assert!(matches!(client.poll_event(), Some(ClientEvent::TwinUpdate { .. })));
        assert!(client.poll_event().is_none());
    }

    #[test]
    fn delivery_history_is_bounded() {
        let mut client = LoopbackProvisioner::new().provision("ABC123", Duration::from_secs(10)).unwrap();
        for i in 0..HISTORY_LEN + 8 {
            client.send_event(&format!(r#"{{"n":"{}"}}"#, i)).unwrap();
            client.send_reported_state(&format!(r#"{{"n":{}}}"#, i)).unwrap();
            client.do_work();
            while client.poll_event().is_some() {}
        }
        assert_eq!(client.sent().len(), HISTORY_LEN);
        assert_eq!(client.reported().len(), HISTORY_LEN);
        assert_eq!(client.sent()[0], r#"{"n":"8"}"#);
        assert_eq!(client.sent().last().unwrap(), &format!(r#"{{"n":"{}"}}"#, HISTORY_LEN + 7));
    }
}
