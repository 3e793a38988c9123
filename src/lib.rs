// PulseWatch — Pulse Oximeter Firmware Library
//
// A single-threaded event loop that polls two buttons, keeps an IoT Hub
// session alive with exponential reconnect backoff, mirrors a couple of
// device-twin properties, and on demand runs a six-second heart rate / SpO2
// measurement on a MAX30102 and reports the averages as telemetry.

pub mod app;
pub mod cloud;
pub mod config;
pub mod dispatch;
pub mod drivers;
pub mod events;
pub mod input;
#[cfg(not(target_os = "espidf"))]
pub mod sim;
pub mod spo2;
pub mod tasks;
pub mod time;

#[cfg(test)]
pub(crate) mod testing;
