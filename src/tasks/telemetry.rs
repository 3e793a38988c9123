// PulseWatch — Telemetry Reporter
//
// One flat `{"<key>":"<value>"}` message per call.  Delivery is confirmed
// asynchronously and only logged; nothing is retried.

use serde_json::Value;

use super::{single_key_document, SendError, Transport};
use crate::config::TELEMETRY_MAX_LEN;

pub const KEY_HEART_RATE: &str = "Heart_rate";
pub const KEY_SPO2: &str = "SpO2";
pub const KEY_HEARTBEAT: &str = "device_heartbeat";

pub fn send_telemetry(transport: &mut impl Transport, key: &str, value: &str) -> Result<(), SendError> {
    let message = single_key_document(key, Value::String(value.to_owned()), TELEMETRY_MAX_LEN)?;
    log::info!("sending telemetry {}", message);
    transport.send_event(&message)
}

pub fn send_heartbeat(transport: &mut impl Transport) -> Result<(), SendError> {
    send_telemetry(transport, KEY_HEARTBEAT, "True")
}
