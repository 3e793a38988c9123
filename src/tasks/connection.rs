// PulseWatch — Cloud Connection Lifecycle
//
// Runs on the cloud timer.  While the network is up and the session is not
// authenticated, every tick throws away the old client and provisions a new
// one.  Failed attempts stretch the timer (10 s, 20 s, 40 s … capped at
// 10 min); success puts it back to the 20 s default.  While authenticated each
// tick pumps the client once and drains what it queued.

use std::time::Duration;

use super::{SendError, Transport};
use crate::cloud::{IotClient, NetworkStatus, ProvisioningError, Provisioner};
use crate::config::*;
use crate::events::{ClientEvent, ConnectionState, ConnectionStatus, Notification};

/// Reconnect period of the cloud timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Connected, or never failed: poll at the default period.
    #[default]
    Idle,
    /// Consecutive provisioning failures, current period in seconds.
    Retrying(u32),
}

impl Backoff {
    pub fn secs(&self) -> u32 {
        match *self {
            Self::Idle => CLOUD_DEFAULT_POLL_SECS,
            Self::Retrying(secs) => secs,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(u64::from(self.secs()))
    }

    pub fn on_failure(&mut self) {
        *self = match *self {
            Self::Idle => Self::Retrying(CLOUD_MIN_RECONNECT_SECS),
            Self::Retrying(secs) => Self::Retrying(secs.saturating_mul(2).min(CLOUD_MAX_RECONNECT_SECS)),
        };
    }

    pub fn on_success(&mut self) {
        *self = Self::Idle;
    }
}

/// What one tick produced.
#[derive(Debug, Default, PartialEq)]
pub struct TickOutcome {
    /// New cloud timer period, when the tick changed it.
    pub reschedule: Option<Duration>,
    pub notifications: Vec<Notification>,
}

pub struct ConnectionManager<N, P: Provisioner> {
    network: N,
    provisioner: P,
    scope_id: String,
    client: Option<P::Client>,
    state: ConnectionState,
    backoff: Backoff,
}

impl<N: NetworkStatus, P: Provisioner> ConnectionManager<N, P> {
    pub fn new(network: N, provisioner: P, scope_id: impl Into<String>) -> Self {
        Self {
            network,
            provisioner,
            scope_id: scope_id.into(),
            client: None,
            state: ConnectionState::Unauthenticated,
            backoff: Backoff::Idle,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn client(&self) -> Option<&P::Client> {
        self.client.as_ref()
    }

    pub fn client_mut(&mut self) -> Option<&mut P::Client> {
        self.client.as_mut()
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    pub fn tick(&mut self) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        match self.network.is_ready() {
            Ok(true) if self.state == ConnectionState::Unauthenticated => {
                match self.connect() {
                    Ok(period) => outcome.reschedule = period,
                    Err(ProvisioningError::ResourceExhausted) => {
                        log::error!("no cloud client handle available, skipping this tick");
                        return outcome;
                    }
                    Err(_) => outcome.reschedule = Some(self.backoff.period()),
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("failed to get network state: {}", e),
        }

        if self.state == ConnectionState::Authenticated {
            self.pump(&mut outcome.notifications);
        }
        outcome
    }

    /// Replace the client.  `Ok` carries the timer period to restore.
    fn connect(&mut self) -> Result<Option<Duration>, ProvisioningError> {
        self.client = None;

        let mut client = match self.provisioner.provision(&self.scope_id, PROVISIONING_TIMEOUT) {
            Ok(client) => client,
            Err(ProvisioningError::ResourceExhausted) => return Err(ProvisioningError::ResourceExhausted),
            Err(e) => {
                self.backoff.on_failure();
                log::warn!(
                    "failure to create cloud client ({}) - will retry in {} seconds",
                    e,
                    self.backoff.secs()
                );
                return Err(e);
            }
        };

        let was_retrying = self.backoff != Backoff::Idle;
        self.backoff.on_success();
        self.state = ConnectionState::Authenticated;
        log::info!("provisioned into scope {}", self.scope_id);

        if let Err(e) = client.set_keep_alive(CLOUD_KEEP_ALIVE) {
            log::error!("failure setting keep-alive: {}", e);
        }
        self.client = Some(client);

        Ok(was_retrying.then(|| self.backoff.period()))
    }

    fn pump(&mut self, notifications: &mut Vec<Notification>) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        client.do_work();

        while let Some(event) = client.poll_event() {
            match event {
                ClientEvent::ConnectionStatus { status, reason } => {
                    let authenticated = status == ConnectionStatus::Authenticated;
                    log::info!("cloud authenticated: {} ({})", authenticated, reason);
                    if authenticated {
                        self.state = ConnectionState::Authenticated;
                        notifications.push(Notification::Authenticated);
                    } else {
                        self.state = ConnectionState::Unauthenticated;
                    }
                }
                ClientEvent::TwinUpdate { state, payload } => {
                    log::debug!("twin update ({:?}, {} bytes)", state, payload.len());
                    notifications.push(Notification::TwinUpdate(payload));
                }
                ClientEvent::SendConfirmed(result) => log::info!("message received by cloud: {:?}", result),
                ClientEvent::ReportedStateAck { status } => log::info!("reported state accepted with status {}", status),
            }
        }
    }
}

impl<N: NetworkStatus, P: Provisioner> Transport for ConnectionManager<N, P> {
    fn send_event(&mut self, message: &str) -> Result<(), SendError> {
        let client = self.client.as_mut().ok_or(SendError::NotConnected)?;
        client.send_event(message)?;
        Ok(())
    }

    fn report_state(&mut self, document: &str) -> Result<(), SendError> {
        let client = self.client.as_mut().ok_or(SendError::NotConnected)?;
        client.send_reported_state(document)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::NetworkError;
    use crate::events::StatusReason;
    use crate::testing::{ScriptedNetwork, ScriptedProvisioner};

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn backoff_doubles_from_min_to_max() {
        let mut backoff = Backoff::default();
        let mut trace = vec![backoff.secs()];
        for _ in 0..7 {
            backoff.on_failure();
            trace.push(backoff.secs());
        }
        assert_eq!(trace, [20, 10, 20, 40, 80, 160, 320, 600]);
        backoff.on_failure();
        assert_eq!(backoff.secs(), 600);
        backoff.on_success();
        assert_eq!(backoff, Backoff::Idle);
        assert_eq!(backoff.period(), secs(20));
    }

    #[test]
    fn retrying_never_collapses_back_to_min() {
        // Passing through 20 s while retrying must keep doubling.
        let mut backoff = Backoff::default();
        backoff.on_failure();
        backoff.on_failure();
        assert_eq!(backoff.secs(), 20);
        backoff.on_failure();
        assert_eq!(backoff.secs(), 40);
    }

    #[test]
    fn provisioning_retries_with_backoff_then_authenticates() {
        let provisioner = ScriptedProvisioner::failing(2);
        let mut manager = ConnectionManager::new(ScriptedNetwork::ready(), provisioner, "ABC123");

        let trace: Vec<_> = (0..3).filter_map(|_| manager.tick().reschedule).collect();
        assert_eq!(trace, [secs(10), secs(20), secs(20)]);
        assert_eq!(manager.state(), ConnectionState::Authenticated);
        assert_eq!(manager.backoff(), Backoff::Idle);
        assert_eq!(manager.provisioner().attempts(), 3);
        assert_eq!(manager.provisioner().last_scope_id(), Some("ABC123".to_owned()));
        assert_eq!(manager.client().map(|c| c.keep_alive()), Some(Some(CLOUD_KEEP_ALIVE)));
    }

    #[test]
    fn first_success_keeps_the_default_period() {
        let mut manager = ConnectionManager::new(ScriptedNetwork::ready(), ScriptedProvisioner::failing(0), "ABC123");
        let outcome = manager.tick();
        assert_eq!(outcome.reschedule, None);
        assert_eq!(manager.state(), ConnectionState::Authenticated);
    }

    #[test]
    fn nothing_happens_while_the_network_is_down() {
        let network = ScriptedNetwork::script([Ok(false), Err(NetworkError("no wifi".into()))]);
        let mut manager = ConnectionManager::new(network, ScriptedProvisioner::failing(0), "ABC123");
        assert_eq!(manager.tick(), TickOutcome::default());
        assert_eq!(manager.tick(), TickOutcome::default());
        assert_eq!(manager.provisioner().attempts(), 0);
        assert_eq!(manager.state(), ConnectionState::Unauthenticated);
    }

    #[test]
    fn network_query_failure_still_pumps_an_authenticated_client() {
        let network = ScriptedNetwork::script([Ok(true), Err(NetworkError("busy".into()))]);
        let mut manager = ConnectionManager::new(network, ScriptedProvisioner::failing(0), "ABC123");
        manager.tick();
        let pumped = manager.client().map(|c| c.work_calls());
        manager.tick();
        assert_eq!(manager.client().map(|c| c.work_calls()), pumped.map(|n| n + 1));
    }

    #[test]
    fn exhausted_handles_skip_the_tick_without_backing_off() {
        let provisioner = ScriptedProvisioner::script([Err(ProvisioningError::ResourceExhausted)]);
        let mut manager = ConnectionManager::new(ScriptedNetwork::ready(), provisioner, "ABC123");
        assert_eq!(manager.tick(), TickOutcome::default());
        assert_eq!(manager.backoff(), Backoff::Idle);
        assert_eq!(manager.state(), ConnectionState::Unauthenticated);
    }

    #[test]
    fn status_events_drive_the_state_and_notify_the_app() {
        let mut manager = ConnectionManager::new(ScriptedNetwork::ready(), ScriptedProvisioner::failing(0), "ABC123");
        manager.tick();

        let client = manager.client_mut().unwrap();
        client.inject(ClientEvent::ConnectionStatus {
            status: ConnectionStatus::Authenticated,
            reason: StatusReason::Ok,
        });
        client.inject(ClientEvent::TwinUpdate {
            state: crate::events::TwinUpdateState::Partial,
            payload: b"{}".to_vec(),
        });
        let outcome = manager.tick();
        assert_eq!(
            outcome.notifications,
            [Notification::Authenticated, Notification::TwinUpdate(b"{}".to_vec())]
        );

        manager.client_mut().unwrap().inject(ClientEvent::ConnectionStatus {
            status: ConnectionStatus::Unauthenticated,
            reason: StatusReason::ExpiredSasToken,
        });
        manager.tick();
        assert_eq!(manager.state(), ConnectionState::Unauthenticated);
    }

    #[test]
    fn deauthentication_does_not_reset_backoff_and_reprovisions() {
        let provisioner = ScriptedProvisioner::script([
            Err(ProvisioningError::NetworkNotReady),
            Ok(()),
            Err(ProvisioningError::DeviceAuthNotReady),
        ]);
        let mut manager = ConnectionManager::new(ScriptedNetwork::ready(), provisioner, "ABC123");
        manager.tick(); // fail → 10 s
        manager.tick(); // success → default
        manager.client_mut().unwrap().inject(ClientEvent::ConnectionStatus {
            status: ConnectionStatus::Unauthenticated,
            reason: StatusReason::RetryExpired,
        });
        manager.tick(); // drains the de-auth
        assert_eq!(manager.backoff(), Backoff::Idle);

        assert_eq!(manager.tick().reschedule, Some(secs(10)));
        assert!(manager.client().is_none());
        assert_eq!(manager.provisioner().attempts(), 3);
    }

    #[test]
    fn sends_without_a_client_fail() {
        let mut manager = ConnectionManager::new(ScriptedNetwork::ready(), ScriptedProvisioner::failing(1), "ABC123");
        assert_eq!(manager.send_event("{}"), Err(SendError::NotConnected));
        manager.tick();
        assert_eq!(manager.report_state("{}"), Err(SendError::NotConnected));
        manager.tick();
        manager.send_event(r#"{"k":"v"}"#).unwrap();
        manager.report_state(r#"{"StatusLED":true}"#).unwrap();
        let client = manager.client().unwrap();
        assert_eq!(client.sent(), [r#"{"k":"v"}"#]);
        assert_eq!(client.reported(), [r#"{"StatusLED":true}"#]);
    }
}
