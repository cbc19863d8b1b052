//! Core identifier types for the sync protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier for a device installation.
///
/// Device IDs are stable for the lifetime of an installation and scope
/// the per-device sequence counters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Creates a device ID from an opaque string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{}", self.0)
    }
}

/// Version of the local database schema.
///
/// A snapshot and the op-log entries applied on top of it must agree on
/// the schema version or the pair is rejected as incompatible.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion(pub String);

impl SchemaVersion {
    /// Creates a schema version from its string form.
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Returns the raw version string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schema:{}", self.0)
    }
}

/// Per-device sequence number for ordering op-log entries.
///
/// Sequence numbers are unique and strictly increasing per
/// `(deviceId, schemaVersion)` with no gaps.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Sequence(pub u64);

impl Sequence {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number, or `None` on overflow.
    #[must_use]
    pub fn checked_next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Identifier for a transport chunk of op-log entries.
///
/// Derived from the originating device and the first sequence in the
/// chunk, which makes chunk assignment deterministic and resend
/// idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub String);

impl ChunkId {
    /// Derives a chunk ID from the device and the first sequence in the chunk.
    #[must_use]
    pub fn derive(device: &DeviceId, first_sequence: Sequence) -> Self {
        Self(format!("{}:{}", device.as_str(), first_sequence.as_u64()))
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk:{}", self.0)
    }
}

/// Caller-supplied token for idempotent command replay detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    /// Generates a fresh correlation ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corr:{}", self.0)
    }
}

/// Identifier for a read-only query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    /// Generates a fresh query ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ordering() {
        let s1 = Sequence::new(1);
        let s2 = Sequence::new(2);
        assert!(s1 < s2);
    }

    #[test]
    fn sequence_checked_next() {
        let s = Sequence::new(5);
        assert_eq!(s.checked_next(), Some(Sequence::new(6)));
        assert_eq!(Sequence::new(u64::MAX).checked_next(), None);
    }

    #[test]
    fn chunk_id_derivation() {
        let device = DeviceId::new("laptop-1");
        let id = ChunkId::derive(&device, Sequence::new(17));
        assert_eq!(id.as_str(), "laptop-1:17");
    }

    #[test]
    fn display_forms() {
        assert_eq!(format!("{}", DeviceId::new("a")), "dev:a");
        assert_eq!(format!("{}", SchemaVersion::new("v1")), "schema:v1");
        assert_eq!(format!("{}", Sequence::new(9)), "seq:9");
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }

    #[test]
    fn sequence_serializes_transparently() {
        let json = serde_json::to_value(Sequence::new(42)).unwrap();
        assert_eq!(json, serde_json::json!(42));
    }
}
