//! Compacted snapshot dumps.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{SchemaVersion, Sequence};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unencrypted bookkeeping for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    /// Size of the encrypted dump in bytes.
    pub size_bytes: u64,
    /// Number of op-log entries folded into this snapshot.
    pub entry_count: u64,
    /// First sequence in the compaction range, if any entries were folded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_sequence: Option<Sequence>,
    /// Last sequence in the compaction range, if any entries were folded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<Sequence>,
}

/// A compacted, encrypted full-state dump valid up to a given sequence.
///
/// A snapshot with `sequence = S` asserts that every op-log entry with
/// `sequence <= S` has been folded in and may be discarded. Snapshots are
/// superseded by later snapshots with a higher sequence, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDto {
    /// Locally generated record identifier.
    pub local_id: Uuid,
    /// Schema version the snapshot was compacted under.
    pub schema_version: SchemaVersion,
    /// Initialization vector for the encrypted dump.
    pub iv: Vec<u8>,
    /// Unencrypted bookkeeping.
    pub meta: SnapshotMeta,
    /// Encrypted full-state blob.
    pub dump: Vec<u8>,
    /// Sequence this snapshot is valid up to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Sequence>,
    /// Creation time, milliseconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl SnapshotDto {
    /// Creates a new snapshot with a fresh local ID.
    pub fn new(
        schema_version: SchemaVersion,
        iv: Vec<u8>,
        meta: SnapshotMeta,
        dump: Vec<u8>,
        sequence: Option<Sequence>,
        created_at: Option<u64>,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            schema_version,
            iv,
            meta,
            dump,
            sequence,
            created_at,
        }
    }

    /// Returns true if this snapshot covers the given sequence.
    ///
    /// An entry at a covered sequence has already been folded in and may
    /// be discarded.
    #[must_use]
    pub fn covers(&self, sequence: Sequence) -> bool {
        self.sequence.is_some_and(|s| sequence <= s)
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(ProtocolError::encode)?;
        Ok(buf)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(ProtocolError::decode)
    }
}
