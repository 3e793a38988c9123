// PulseWatch — Application Tasks
//
// Everything here runs on the dispatcher thread.  Outbound traffic goes through
// `Transport`, which the connection manager implements on top of whatever
// cloud client it currently holds.

use thiserror::Error;

use crate::cloud::ClientError;

pub mod acquisition;
pub mod connection;
pub mod telemetry;
pub mod twin;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("no cloud client")]
    NotConnected,
    #[error(transparent)]
    Rejected(#[from] ClientError),
    #[error("could not encode message: {0}")]
    Encode(String),
    #[error("message is {len} bytes, limit is {max}")]
    TooLarge { len: usize, max: usize },
}

/// Fire-and-forget hand-off to the cloud.
pub trait Transport {
    fn send_event(&mut self, message: &str) -> Result<(), SendError>;

    fn report_state(&mut self, document: &str) -> Result<(), SendError>;
}

/// Serialise a single-key JSON object, refusing anything over `max` bytes.
pub(crate) fn single_key_document(key: &str, value: serde_json::Value, max: usize) -> Result<String, SendError> {
    let mut object = serde_json::Map::new();
    object.insert(key.to_owned(), value);
    let document = serde_json::to_string(&object).map_err(|e| SendError::Encode(e.to_string()))?;
    if document.len() > max {
        return Err(SendError::TooLarge { len: document.len(), max });
    }
    Ok(document)
}
