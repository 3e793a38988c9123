// PulseWatch — Device Twin Synchronizer
//
// Desired properties understood by the device:
//   StatusLED  {"value": bool}    → drives the status LED
//   nprId      {"value": string}  → stored, echoed as "nprId" and "nprId_property"
// Every applied property is acknowledged with a one-key reported document.

use embedded_hal::digital::OutputPin;
use serde_json::{Map, Value};
use thiserror::Error;

use super::{single_key_document, SendError, Transport};
use crate::config::{NPR_ID_MAX_LEN, REPORTED_STATE_MAX_LEN};
use crate::drivers::led::StatusLed;
use crate::events::SensorInfo;

pub const PROP_STATUS_LED: &str = "StatusLED";
pub const PROP_NPR_ID: &str = "nprId";
pub const PROP_NPR_ID_ECHO: &str = "nprId_property";
pub const PROP_SENSOR_REVISION: &str = "max30102_revision";
pub const PROP_SENSOR_PART_ID: &str = "max30102_part_id";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TwinError {
    #[error("malformed twin document: {0}")]
    Malformed(String),
    #[error("twin document is not a JSON object")]
    NotAnObject,
}

pub struct TwinSynchronizer<P> {
    led: StatusLed<P>,
    npr_id: String,
}

impl<P: OutputPin> TwinSynchronizer<P> {
    pub fn new(led: StatusLed<P>) -> Self {
        Self {
            led,
            npr_id: String::new(),
        }
    }

    pub fn status_led(&self) -> bool {
        self.led.is_on()
    }

    pub fn npr_id(&self) -> &str {
        &self.npr_id
    }

    pub fn led_mut(&mut self) -> &mut StatusLed<P> {
        &mut self.led
    }

    /// Apply a twin document; returns how many reported properties were queued.
    ///
    /// A malformed document changes nothing.  Problems with individual
    /// properties are logged and skipped.
    pub fn apply(&mut self, payload: &[u8], transport: &mut impl Transport) -> Result<usize, TwinError> {
        let root: Value = serde_json::from_slice(payload).map_err(|e| TwinError::Malformed(e.to_string()))?;
        let root = root.as_object().ok_or(TwinError::NotAnObject)?;
        // Full documents nest the desired set; patches are the desired set.
        let desired = root.get("desired").and_then(Value::as_object).unwrap_or(root);

        let mut queued = 0;
        if let Some(on) = property_value(desired, PROP_STATUS_LED, Value::as_bool) {
            queued += self.apply_status_led(on, transport);
        }
        if let Some(id) = property_value(desired, PROP_NPR_ID, Value::as_str) {
            queued += self.apply_npr_id(id, transport);
        }
        Ok(queued)
    }

    fn apply_status_led(&mut self, on: bool, transport: &mut impl Transport) -> usize {
        if let Err(e) = self.led.set(on) {
            log::warn!("{}", e);
            return 0;
        }
        log::info!("status LED set to {}", on);
        report(transport, PROP_STATUS_LED, Value::Bool(on))
    }

    fn apply_npr_id(&mut self, id: &str, transport: &mut impl Transport) -> usize {
        // Stored in an 11-byte field; both echoes must fit a reported document.
        if id.len() > NPR_ID_MAX_LEN {
            log::warn!("ignoring nprId {:?}: longer than {} bytes", id, NPR_ID_MAX_LEN);
            return 0;
        }
        let documents = [PROP_NPR_ID, PROP_NPR_ID_ECHO]
            .into_iter()
            .map(|name| {
                single_key_document(name, Value::String(id.to_owned()), REPORTED_STATE_MAX_LEN).map(|doc| (name, doc))
            })
            .collect::<Result<Vec<_>, _>>();
        let documents = match documents {
            Ok(documents) => documents,
            Err(e) => {
                log::warn!("ignoring nprId {:?}: {}", id, e);
                return 0;
            }
        };

        self.npr_id = id.to_owned();
        log::info!("nprId set to {:?}", self.npr_id);
        documents
            .iter()
            .map(|(name, document)| submit(transport, name, document))
            .sum()
    }
}

/// `desired[name].value`, if present and of the expected type.
fn property_value<'a, T>(desired: &'a Map<String, Value>, name: &str, cast: fn(&'a Value) -> Option<T>) -> Option<T> {
    let value = desired.get(name)?.get("value");
    let typed = value.and_then(cast);
    if typed.is_none() {
        log::warn!("twin property {} has no usable value: {:?}", name, value);
    }
    typed
}

/// Queue one reported property; 1 when handed off, 0 when it was dropped.
fn report(transport: &mut impl Transport, name: &str, value: Value) -> usize {
    match single_key_document(name, value, REPORTED_STATE_MAX_LEN) {
        Ok(document) => submit(transport, name, &document),
        Err(e) => {
            log::warn!("could not report {}: {}", name, e);
            0
        }
    }
}

fn submit(transport: &mut impl Transport, name: &str, document: &str) -> usize {
    log::debug!("reporting {}", document);
    match transport.report_state(document) {
        Ok(()) => 1,
        Err(e) => {
            log::warn!("could not report {}: {}", name, e);
            0
        }
    }
}

pub fn report_state(transport: &mut impl Transport, name: &str, value: Value) -> Result<(), SendError> {
    let document = single_key_document(name, value, REPORTED_STATE_MAX_LEN)?;
    log::debug!("reporting {}", document);
    transport.report_state(&document)
}

/// Publish the sensor identity registers as reported string properties.
pub fn report_sensor_info(transport: &mut impl Transport, info: &SensorInfo) -> usize {
    report(transport, PROP_SENSOR_REVISION, Value::String(info.revision_string()))
        + report(transport, PROP_SENSOR_PART_ID, Value::String(info.part_id_string()))
}
