// PulseWatch — ESP32 Cloud Client (Azure DPS + IoT Hub over MQTT)
//
// Provisioning registers the device with DPS using its X.509 certificate and
// learns the assigned hub.  The hub session itself is opened on the first
// `do_work`, so the keep-alive chosen by the caller applies.  A helper thread
// per MQTT connection turns ESP-IDF events into owned messages on a channel;
// `do_work` drains that channel on the main thread.

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use embedded_svc::mqtt::client::{Details, EventPayload, QoS};
use esp_idf_svc::mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration};
use esp_idf_svc::sys::{esp_crt_bundle_attach, esp_wifi_sta_get_ap_info, wifi_ap_record_t, ESP_ERR_WIFI_NOT_CONNECT, ESP_OK};
use esp_idf_svc::tls::X509;

use super::azure::{self, HubTopic, Registration};
use super::{ClientError, IotClient, NetworkError, NetworkStatus, ProvisioningError, Provisioner};
use crate::events::{ClientEvent, Confirmation, ConnectionStatus, StatusReason, TwinUpdateState};

const PUMP_STACK_SIZE: usize = 8 * 1024;
const DPS_DEFAULT_RETRY: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Network readiness
// ---------------------------------------------------------------------------

/// Wi-Fi station association, as reported by the driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct WifiStation;

impl NetworkStatus for WifiStation {
    fn is_ready(&mut self) -> Result<bool, NetworkError> {
        let mut ap_info = wifi_ap_record_t::default();
        let rc = unsafe { esp_wifi_sta_get_ap_info(&mut ap_info) };
        match rc {
            rc if rc == ESP_OK => Ok(true),
            rc if rc == ESP_ERR_WIFI_NOT_CONNECT as i32 => Ok(false),
            rc => Err(NetworkError(format!("esp_wifi_sta_get_ap_info: esp_err_t={}", rc))),
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT event pump
// ---------------------------------------------------------------------------

/// ESP-IDF MQTT events, copied out of the callback buffers.
enum Inbound {
    Connected,
    Disconnected,
    Published(u32),
    Received { topic: String, data: Vec<u8> },
}

fn spawn_pump(mut conn: EspMqttConnection, tx: Sender<Inbound>) -> Result<(), String> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(PUMP_STACK_SIZE)
        .spawn(move || {
            // `next` fails once the client side is dropped.
            while let Ok(event) = conn.next() {
                let inbound = match event.payload() {
                    EventPayload::Connected(_) => Inbound::Connected,
                    EventPayload::Disconnected => Inbound::Disconnected,
                    EventPayload::Published(id) => Inbound::Published(id),
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => Inbound::Received {
                        topic: topic.to_owned(),
                        data: data.to_vec(),
                    },
                    EventPayload::Error(e) => {
                        log::warn!("mqtt error: {:?}", e);
                        continue;
                    }
                    _ => continue,
                };
                if tx.send(inbound).is_err() {
                    break;
                }
            }
            log::debug!("mqtt event pump stopped");
        })
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Device identity presented to DPS and the hub.
#[derive(Clone, Copy)]
pub struct DeviceIdentity {
    pub registration_id: &'static str,
    /// NUL-terminated PEM.
    pub certificate: &'static str,
    /// NUL-terminated PEM.
    pub private_key: &'static str,
}

impl DeviceIdentity {
    fn mqtt_config<'a>(&self, client_id: &'a str, username: &'a str, keep_alive: Option<Duration>) -> MqttClientConfiguration<'a> {
        MqttClientConfiguration {
            client_id: Some(client_id),
            username: Some(username),
            keep_alive_interval: keep_alive,
            client_certificate: Some(X509::pem_until_nul(self.certificate.as_bytes())),
            private_key: Some(X509::pem_until_nul(self.private_key.as_bytes())),
            crt_bundle_attach: Some(esp_crt_bundle_attach),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

pub struct DpsProvisioner {
    identity: DeviceIdentity,
}

impl DpsProvisioner {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self { identity }
    }

    fn register(&self, scope_id: &str, deadline: Instant) -> Result<(String, String), ProvisioningError> {
        let registration_id = self.identity.registration_id;
        let username = azure::dps_username(scope_id, registration_id);
        let config = self.identity.mqtt_config(registration_id, &username, None);

        let (mut client, conn) = EspMqttClient::new(&azure::mqtts_url(azure::DPS_HOST), &config).map_err(|e| {
            if e.code() == esp_idf_svc::sys::ESP_ERR_NO_MEM as i32 {
                ProvisioningError::ResourceExhausted
            } else {
                ProvisioningError::Generic(e.to_string())
            }
        })?;
        let (tx, rx) = mpsc::channel();
        spawn_pump(conn, tx).map_err(ProvisioningError::Generic)?;

        wait_for(&rx, deadline, |inbound| matches!(inbound, Inbound::Connected).then_some(()))?;
        client
            .subscribe(azure::DPS_RESPONSE_FILTER, QoS::AtLeastOnce)
            .map_err(|e| ProvisioningError::Generic(e.to_string()))?;

        let mut rid = 1;
        let mut topic = azure::dps_register_topic(rid);
        let mut body = azure::dps_register_body(registration_id);
        loop {
            client
                .enqueue(&topic, QoS::AtLeastOnce, false, body.as_bytes())
                .map_err(|e| ProvisioningError::Generic(e.to_string()))?;

            let (status, retry_after, payload) = wait_for(&rx, deadline, |inbound| match inbound {
                Inbound::Received { topic, data } => {
                    azure::dps_response(&topic).map(|(status, retry)| (status, retry, data))
                }
                _ => None,
            })?;

            match azure::parse_registration(status, &payload)? {
                Registration::Assigned { hub, device_id } => return Ok((hub, device_id)),
                Registration::Assigning { operation_id } => {
                    let pause = retry_after.map_or(DPS_DEFAULT_RETRY, Duration::from_secs);
                    if Instant::now() + pause >= deadline {
                        return Err(ProvisioningError::Timeout);
                    }
                    thread::sleep(pause);
                    rid += 1;
                    topic = azure::dps_status_topic(rid, &operation_id);
                    body = String::new();
                }
            }
        }
    }
}

/// Block on the pump channel until `pick` accepts a message or time runs out.
fn wait_for<T>(
    rx: &Receiver<Inbound>,
    deadline: Instant,
    mut pick: impl FnMut(Inbound) -> Option<T>,
) -> Result<T, ProvisioningError> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(Inbound::Disconnected) => return Err(ProvisioningError::NetworkNotReady),
            Ok(inbound) => {
                if let Some(found) = pick(inbound) {
                    return Ok(found);
                }
            }
            Err(RecvTimeoutError::Timeout) => return Err(ProvisioningError::Timeout),
            Err(RecvTimeoutError::Disconnected) => return Err(ProvisioningError::NetworkNotReady),
        }
    }
}

impl Provisioner for DpsProvisioner {
    type Client = HubClient;

    fn provision(&mut self, scope_id: &str, timeout: Duration) -> Result<HubClient, ProvisioningError> {
        if scope_id.is_empty() {
            return Err(ProvisioningError::InvalidParam);
        }
        let (hub, device_id) = self.register(scope_id, Instant::now() + timeout)?;
        log::info!("DPS assigned device {} to {}", device_id, hub);
        Ok(HubClient::new(self.identity, hub, device_id))
    }
}

// ---------------------------------------------------------------------------
// IoT Hub session
// ---------------------------------------------------------------------------

struct Session {
    client: EspMqttClient<'static>,
    rx: Receiver<Inbound>,
}

enum Outbound {
    Telemetry(String),
    Reported(String),
}

pub struct HubClient {
    identity: DeviceIdentity,
    hub: String,
    device_id: String,
    keep_alive: Option<Duration>,
    session: Option<Session>,
    outbox: VecDeque<Outbound>,
    events: VecDeque<ClientEvent>,
    telemetry_ids: HashSet<u32>,
    next_rid: u32,
    closed: bool,
}

impl HubClient {
    fn new(identity: DeviceIdentity, hub: String, device_id: String) -> Self {
        Self {
            identity,
            hub,
            device_id,
            keep_alive: None,
            session: None,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            telemetry_ids: HashSet::new(),
            next_rid: 1,
            closed: false,
        }
    }

    fn rid(&mut self) -> u32 {
        let rid = self.next_rid;
        self.next_rid = self.next_rid.wrapping_add(1).max(1);
        rid
    }

    fn open(&mut self) -> Result<(), String> {
        let username = azure::hub_username(&self.hub, &self.device_id);
        let config = self.identity.mqtt_config(&self.device_id, &username, self.keep_alive);
        let (client, conn) = EspMqttClient::new(&azure::mqtts_url(&self.hub), &config).map_err(|e| e.to_string())?;
        let (tx, rx) = mpsc::channel();
        spawn_pump(conn, tx)?;
        self.session = Some(Session { client, rx });
        Ok(())
    }

    fn unauthenticated(&mut self, reason: StatusReason) {
        self.events.push_back(ClientEvent::ConnectionStatus {
            status: ConnectionStatus::Unauthenticated,
            reason,
        });
    }

    fn on_connected(&mut self) {
        let rid = self.rid();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        for filter in [azure::TWIN_RESPONSE_FILTER, azure::TWIN_DESIRED_FILTER] {
            if let Err(e) = session.client.subscribe(filter, QoS::AtMostOnce) {
                log::warn!("subscribe to {} failed: {}", filter, e);
            }
        }
        if let Err(e) = session.client.enqueue(&azure::twin_get_topic(rid), QoS::AtMostOnce, false, &[]) {
            log::warn!("twin request failed: {}", e);
        }
        self.events.push_back(ClientEvent::ConnectionStatus {
            status: ConnectionStatus::Authenticated,
            reason: StatusReason::Ok,
        });
    }

    fn on_received(&mut self, topic: &str, data: Vec<u8>) {
        let event = match azure::classify_hub_topic(topic) {
            HubTopic::DesiredPatch => ClientEvent::TwinUpdate {
                state: TwinUpdateState::Partial,
                payload: data,
            },
            HubTopic::TwinResponse { status: 200, .. } => ClientEvent::TwinUpdate {
                state: TwinUpdateState::Complete,
                payload: data,
            },
            HubTopic::TwinResponse { status, .. } => ClientEvent::ReportedStateAck { status },
            HubTopic::Other => {
                log::debug!("ignoring message on {}", topic);
                return;
            }
        };
        self.events.push_back(event);
    }

    fn flush_outbox(&mut self) {
        while let Some(item) = self.outbox.pop_front() {
            let (topic, payload, telemetry) = match &item {
                Outbound::Telemetry(message) => (azure::telemetry_topic(&self.device_id), message, true),
                Outbound::Reported(document) => (azure::twin_reported_topic(self.rid()), document, false),
            };
            let Some(session) = self.session.as_mut() else {
                self.outbox.push_front(item);
                return;
            };
            match session.client.enqueue(&topic, QoS::AtLeastOnce, false, payload.as_bytes()) {
                Ok(id) if telemetry => {
                    self.telemetry_ids.insert(id);
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("publish to {} failed: {}", topic, e);
                    if telemetry {
                        self.events.push_back(ClientEvent::SendConfirmed(Confirmation::Error));
                    }
                }
            }
        }
    }
}

impl IotClient for HubClient {
    fn set_keep_alive(&mut self, period: Duration) -> Result<(), ClientError> {
        if self.session.is_some() {
            return Err(ClientError::Option("keep-alive"));
        }
        self.keep_alive = Some(period);
        Ok(())
    }

    fn send_event(&mut self, message: &str) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        self.outbox.push_back(Outbound::Telemetry(message.to_owned()));
        Ok(())
    }

    fn send_reported_state(&mut self, document: &str) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        self.outbox.push_back(Outbound::Reported(document.to_owned()));
        Ok(())
    }

    fn do_work(&mut self) {
        if self.closed {
            return;
        }
        if self.session.is_none() {
            if let Err(e) = self.open() {
                log::error!("could not open IoT Hub session: {}", e);
                self.closed = true;
                self.unauthenticated(StatusReason::CommunicationError);
                return;
            }
        }

        let mut inbound = Vec::new();
        if let Some(session) = self.session.as_ref() {
            inbound.extend(session.rx.try_iter());
        }
        for message in inbound {
            match message {
                Inbound::Connected => self.on_connected(),
                Inbound::Disconnected => {
                    self.closed = true;
                    self.unauthenticated(StatusReason::NoNetwork);
                }
                Inbound::Published(id) => {
                    if self.telemetry_ids.remove(&id) {
                        self.events.push_back(ClientEvent::SendConfirmed(Confirmation::Ok));
                    }
                }
                Inbound::Received { topic, data } => self.on_received(&topic, data),
            }
        }

        if !self.closed {
            self.flush_outbox();
        }
    }

    fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        let pending = self.telemetry_ids.len() + self.outbox.len();
        if pending > 0 {
            log::debug!("dropping IoT Hub client with {} undelivered messages", pending);
        }
    }
}
