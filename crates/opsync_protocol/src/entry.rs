//! Encrypted op-log entries.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{ChunkId, DeviceId, SchemaVersion, Sequence};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current op-log record format version.
pub const OPLOG_FORMAT_VERSION: u32 = 1;

/// A single encrypted mutation record with a device-scoped sequence number.
///
/// `data` is the encrypted payload and `iv` the per-record initialization
/// vector that decrypts it; the IV is never reused within the lifetime of
/// an encryption key. `queryKeys` is the ordered set of index keys the
/// entry affects, used for last-writer-wins merging and query routing.
/// `chunkId` groups entries emitted together for transport; a chunk never
/// spans a compaction boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpLogDto {
    /// Locally generated record identifier.
    pub local_id: Uuid,
    /// Originating device.
    pub device_id: DeviceId,
    /// Transport chunk this entry belongs to.
    pub chunk_id: ChunkId,
    /// Record format version.
    pub version: u32,
    /// Schema version the entry was written under.
    pub schema_version: SchemaVersion,
    /// Device-scoped sequence number, strictly increasing with no gaps.
    pub sequence: Sequence,
    /// Per-record initialization vector.
    pub iv: Vec<u8>,
    /// Encrypted payload.
    pub data: Vec<u8>,
    /// Ordered set of index keys the entry affects.
    pub query_keys: Vec<String>,
}

impl OpLogDto {
    /// Creates a new op-log entry with a fresh local ID.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: DeviceId,
        chunk_id: ChunkId,
        schema_version: SchemaVersion,
        sequence: Sequence,
        iv: Vec<u8>,
        data: Vec<u8>,
        query_keys: Vec<String>,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            device_id,
            chunk_id,
            version: OPLOG_FORMAT_VERSION,
            schema_version,
            sequence,
            iv,
            data,
            query_keys,
        }
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

    /// Returns the size of the encrypted payload in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> OpLogDto {
        OpLogDto::new(
            DeviceId::new("laptop-1"),
            ChunkId::derive(&DeviceId::new("laptop-1"), Sequence::new(1)),
            SchemaVersion::new("v1"),
            Sequence::new(1),
            vec![0u8; 12],
            vec![0xDE, 0xAD, 0xBE, 0xEF],
            vec!["notes/7".into(), "tags/todo".into()],
        )
    }

    #[test]
    fn entry_roundtrip() {
        let entry = sample_entry();
        let bytes = entry.encode().unwrap();
        let decoded = OpLogDto::decode(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn payload_size() {
        assert_eq!(sample_entry().payload_size(), 4);
    }

    #[test]
    fn wire_field_names() {
        let json = serde_json::to_value(sample_entry()).unwrap();
        let obj = json.as_object().unwrap();
        for field in [
            "localId",
            "deviceId",
            "chunkId",
            "version",
            "schemaVersion",
            "sequence",
            "iv",
            "data",
            "queryKeys",
        ] {
            assert!(obj.contains_key(field), "missing field {field}");
        }
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(OpLogDto::decode(&[0xFF, 0x00, 0x01]).is_err());
    }
}
