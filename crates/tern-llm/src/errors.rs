//! Transport error taxonomy.

use thiserror::Error;

/// Failure raised by a model transport, either when opening the stream or
/// while it is being consumed.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LlmError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}
