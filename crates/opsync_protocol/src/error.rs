//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR encoding failed.
    #[error("encode error: {message}")]
    Encode {
        /// Description of the failure.
        message: String,
    },

    /// CBOR decoding failed.
    #[error("decode error: {message}")]
    Decode {
        /// Description of the failure.
        message: String,
    },

    /// A message field violated a structural constraint.
    #[error("invalid message: {message}")]
    InvalidMessage {
        /// Description of the violation.
        message: String,
    },
}

impl ProtocolError {
    /// Creates an encode error.
    pub fn encode(message: impl ToString) -> Self {
        Self::Encode {
            message: message.to_string(),
        }
    }

    /// Creates a decode error.
    pub fn decode(message: impl ToString) -> Self {
        Self::Decode {
            message: message.to_string(),
        }
    }

    /// Creates an invalid-message error.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }
}
