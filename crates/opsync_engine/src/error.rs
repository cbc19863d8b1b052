//! Error types for the sync engine.

use opsync_protocol::{DeviceId, ProtocolError, SchemaVersion, Sequence};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Decryption of an entry or snapshot failed.
    ///
    /// The record is quarantined and sync for the device pauses.
    #[error("decryption failed: {message}")]
    DecryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Encryption failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Invalid encryption key size.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Expected size in bytes.
        expected: usize,
        /// Actual size in bytes.
        actual: usize,
    },

    /// A gap was detected in a device's sequence numbers.
    ///
    /// Recoverable only by re-pulling from a fresh snapshot.
    #[error("sequence gap for {device}: expected {expected}, found {found}")]
    SequenceGap {
        /// Device whose journal has the gap.
        device: DeviceId,
        /// Sequence that was expected next.
        expected: Sequence,
        /// Sequence that was actually observed.
        found: Sequence,
    },

    /// A snapshot and the entries applied on top of it disagree on schema version.
    ///
    /// Fatal for the current reconciliation epoch; requires migration.
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Schema version of the base state.
        expected: SchemaVersion,
        /// Schema version that was observed.
        found: SchemaVersion,
    },

    /// An entry at or below the snapshot's sequence was replayed into compaction.
    #[error("entry {sequence} already compacted into snapshot at {snapshot}")]
    AlreadyCompacted {
        /// Sequence of the rejected entry.
        sequence: Sequence,
        /// Sequence the snapshot is valid up to.
        snapshot: Sequence,
    },

    /// The sequence counter for a device is exhausted.
    ///
    /// Process-fatal; never silently wrapped.
    #[error("sequence allocator overflow for {device} ({schema})")]
    AllocatorOverflow {
        /// Device whose counter overflowed.
        device: DeviceId,
        /// Schema version of the exhausted counter.
        schema: SchemaVersion,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A round-trip exceeded its caller-supplied timeout.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled between state transitions.
    #[error("sync cancelled")]
    Cancelled,

    /// A state transition was attempted from an incompatible state.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// No handler is registered for a dispatched message kind.
    #[error("no handler registered for {kind}")]
    NoHandler {
        /// The unhandled discriminator.
        kind: String,
    },

    /// A collaborator returned a response of the wrong shape.
    #[error("unexpected response: {message}")]
    UnexpectedResponse {
        /// Description of the mismatch.
        message: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Protocol codec error.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),
}

impl EngineError {
    /// Creates a decryption failure.
    pub fn decryption_failed(message: impl Into<String>) -> Self {
        Self::DecryptionFailed {
            message: message.into(),
        }
    }

    /// Creates an encryption failure.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an unexpected-response error.
    pub fn unexpected_response(message: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            message: message.into(),
        }
    }

    /// Returns true if this error is transient and the cycle can be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Transport { retryable, .. } => *retryable,
            EngineError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true if this error is fatal for the reconciliation epoch.
    ///
    /// Epoch-fatal errors require external intervention (migration or
    /// re-sync from a fresh snapshot) before the device can sync again.
    #[must_use]
    pub fn is_epoch_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::SequenceGap { .. }
                | EngineError::SchemaVersionMismatch { .. }
                | EngineError::DecryptionFailed { .. }
        )
    }
}
