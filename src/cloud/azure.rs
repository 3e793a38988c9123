// PulseWatch — Azure IoT MQTT Conventions
//
// Topic names, usernames and response parsing for the Device Provisioning
// Service (DPS) and IoT Hub MQTT endpoints.  Pure string and JSON handling, so
// it is exercised off-target even though only the ESP client uses it.

use serde::Deserialize;

use super::ProvisioningError;

pub const DPS_HOST: &str = "global.azure-devices-provisioning.net";
pub const MQTT_TLS_PORT: u16 = 8883;

const DPS_API_VERSION: &str = "2019-03-31";
const HUB_API_VERSION: &str = "2021-04-12";

pub const DPS_RESPONSE_FILTER: &str = "$dps/registrations/res/#";
pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
pub const TWIN_DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";

const DPS_RESPONSE_PREFIX: &str = "$dps/registrations/res/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

pub fn mqtts_url(host: &str) -> String {
    format!("mqtts://{}:{}", host, MQTT_TLS_PORT)
}

pub fn dps_username(scope_id: &str, registration_id: &str) -> String {
    format!("{}/registrations/{}/api-version={}", scope_id, registration_id, DPS_API_VERSION)
}

pub fn dps_register_topic(rid: u32) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={}", rid)
}

pub fn dps_status_topic(rid: u32, operation_id: &str) -> String {
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={}&operationId={}",
        rid, operation_id
    )
}

pub fn dps_register_body(registration_id: &str) -> String {
    serde_json::json!({ "registrationId": registration_id }).to_string()
}

pub fn hub_username(hub: &str, device_id: &str) -> String {
    format!("{}/{}/?api-version={}", hub, device_id, HUB_API_VERSION)
}

pub fn telemetry_topic(device_id: &str) -> String {
    format!("devices/{}/messages/events/", device_id)
}

pub fn twin_get_topic(rid: u32) -> String {
    format!("$iothub/twin/GET/?$rid={}", rid)
}

pub fn twin_reported_topic(rid: u32) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={}", rid)
}

/// Status code and query string of a `<prefix><status>/?<query>` topic.
fn status_and_query<'a>(topic: &'a str, prefix: &str) -> Option<(u16, &'a str)> {
    let rest = topic.strip_prefix(prefix)?;
    let (status, query) = rest.split_once('/').unwrap_or((rest, ""));
    let status = status.parse().ok()?;
    Some((status, query.trim_start_matches('?')))
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// What an inbound IoT Hub message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubTopic {
    /// Reply to a twin GET (200 with the full document) or reported patch (204).
    TwinResponse { status: u16, rid: Option<u32> },
    DesiredPatch,
    Other,
}

pub fn classify_hub_topic(topic: &str) -> HubTopic {
    if topic.starts_with(TWIN_DESIRED_PREFIX) {
        return HubTopic::DesiredPatch;
    }
    match status_and_query(topic, TWIN_RESPONSE_PREFIX) {
        Some((status, query)) => HubTopic::TwinResponse {
            status,
            rid: query_param(query, "$rid").and_then(|rid| rid.parse().ok()),
        },
        None => HubTopic::Other,
    }
}

/// Status code and suggested retry delay (seconds) of a DPS response topic.
pub fn dps_response(topic: &str) -> Option<(u16, Option<u64>)> {
    let (status, query) = status_and_query(topic, DPS_RESPONSE_PREFIX)?;
    let retry_after = query_param(query, "retry-after").and_then(|secs| secs.parse().ok());
    Some((status, retry_after))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationResponse {
    operation_id: Option<String>,
    status: Option<String>,
    registration_state: Option<RegistrationState>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    assigned_hub: Option<String>,
    device_id: Option<String>,
    error_message: Option<String>,
}

/// Where a registration stands after one DPS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Assigning { operation_id: String },
    Assigned { hub: String, device_id: String },
}

pub fn parse_registration(status: u16, payload: &[u8]) -> Result<Registration, ProvisioningError> {
    let response: RegistrationResponse =
        serde_json::from_slice(payload).map_err(|e| ProvisioningError::Generic(format!("bad DPS response: {}", e)))?;

    if status >= 300 && status != 429 {
        let reason = response
            .message
            .or_else(|| response.registration_state.and_then(|s| s.error_message))
            .unwrap_or_else(|| format!("status {}", status));
        return Err(match status {
            401 | 403 => ProvisioningError::DeviceAuthNotReady,
            _ => ProvisioningError::DeviceError(reason),
        });
    }

    match response.status.as_deref() {
        Some("assigned") => {
            let state = response
                .registration_state
                .ok_or_else(|| ProvisioningError::Generic("assigned without registration state".into()))?;
            match (state.assigned_hub, state.device_id) {
                (Some(hub), Some(device_id)) => Ok(Registration::Assigned { hub, device_id }),
                _ => Err(ProvisioningError::Generic("assignment is missing hub or device id".into())),
            }
        }
        Some("failed") | Some("disabled") => Err(ProvisioningError::DeviceError(
            response
                .registration_state
                .and_then(|s| s.error_message)
                .unwrap_or_else(|| "registration failed".into()),
        )),
        _ => response
            .operation_id
            .map(|operation_id| Registration::Assigning { operation_id })
            .ok_or_else(|| ProvisioningError::Generic("DPS response without operation id".into())),
    }
}
