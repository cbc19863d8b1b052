//! Local append path.
//!
//! A writer turns a plaintext record into a durable op-log entry. The
//! mutation travels the same route a remote one would: the writer builds
//! the entry, dispatches `createOpLog` on the bus, and publishes the
//! resulting `opLogCreated` event to subscribers.

use crate::bus::MessageBus;
use crate::chunker::OpLogChunker;
use crate::crypto::CryptoCodec;
use crate::error::{EngineError, EngineResult};
use crate::sequence::SequenceAllocator;
use opsync_protocol::{
    Command, CorrelationId, DeviceId, Event, EventKind, OpLogDto, SchemaVersion, Sequence,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Appends locally originated mutations to the op log.
///
/// One writer exists per `(deviceId, schemaVersion)` pair. The append
/// path is serialized so allocated sequences hit the store in order and
/// the journal never observes a gap.
pub struct OpLogWriter {
    device_id: DeviceId,
    schema_version: SchemaVersion,
    allocator: Arc<SequenceAllocator>,
    crypto: Arc<CryptoCodec>,
    chunker: Arc<OpLogChunker>,
    bus: Arc<MessageBus>,
    append_serial: Mutex<()>,
}

impl OpLogWriter {
    /// Creates a writer for one `(deviceId, schemaVersion)` pair.
    pub fn new(
        device_id: DeviceId,
        schema_version: SchemaVersion,
        allocator: Arc<SequenceAllocator>,
        crypto: Arc<CryptoCodec>,
        chunker: Arc<OpLogChunker>,
        bus: Arc<MessageBus>,
    ) -> Self {
        // A chunk never spans a compaction boundary. When a snapshot
        // commits on this bus, the open chunk closes and the next append
        // starts a fresh one.
        let boundary_chunker = Arc::clone(&chunker);
        let boundary_device = device_id.clone();
        bus.subscribe(move |event: &Event| {
            if event.kind() == EventKind::SnapshotCreated {
                boundary_chunker.seal(&boundary_device);
            }
        });

        Self {
            device_id,
            schema_version,
            allocator,
            crypto,
            chunker,
            bus,
            append_serial: Mutex::new(()),
        }
    }

    /// Returns the device this writer appends for.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Appends a plaintext record to the op log.
    ///
    /// Allocates the next sequence, encrypts the record, assigns a
    /// transport chunk, and dispatches `createOpLog` with a fresh
    /// correlation ID. The `opLogCreated` event is published to bus
    /// subscribers before this returns.
    pub fn append(&self, plaintext: &[u8], query_keys: Vec<String>) -> EngineResult<OpLogDto> {
        let _serial = self.append_serial.lock();

        let sequence = self.allocator.next(&self.device_id, &self.schema_version)?;
        let (iv, data) = self.crypto.encrypt(plaintext)?;
        let chunk_id = self.chunker.assign(&self.device_id, sequence, data.len());

        let entry = OpLogDto::new(
            self.device_id.clone(),
            chunk_id,
            self.schema_version.clone(),
            sequence,
            iv,
            data,
            query_keys,
        );

        let command = Command::create_op_log(entry.clone())
            .with_correlation_id(CorrelationId::generate());
        let outcome = self.bus.dispatch(&command)?;
        let event = outcome
            .event()
            .ok_or_else(|| EngineError::unexpected_response("createOpLog produced no event"))?;

        tracing::debug!(
            device = %self.device_id,
            sequence = %sequence,
            chunk = %entry.chunk_id,
            "appended op-log entry"
        );
        self.bus.publish(event);

        Ok(entry)
    }

    /// Seeds the allocator from the journal tail after a restart.
    pub fn resume_from(&self, last: Sequence) {
        self.allocator
            .seed(&self.device_id, &self.schema_version, last);
    }

    /// Closes the open transport chunk, typically at a compaction
    /// boundary. The next append starts a fresh chunk.
    pub fn seal_chunk(&self) {
        self.chunker.seal(&self.device_id);
    }
}

impl std::fmt::Debug for OpLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpLogWriter")
            .field("device_id", &self.device_id)
            .field("schema_version", &self.schema_version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkerConfig;
    use crate::crypto::EncryptionKey;
    use crate::node::SyncNode;
    use crate::store::{MemoryOpLogStore, MemorySnapshotStore, OpLogStore};
    use opsync_protocol::{SnapshotDto, SnapshotMeta};
    use parking_lot::Mutex as PlMutex;

    fn writer() -> (OpLogWriter, Arc<MemoryOpLogStore>, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new(64));
        let oplog = Arc::new(MemoryOpLogStore::new());
        SyncNode::install(
            Arc::clone(&bus),
            Arc::clone(&oplog) as Arc<dyn OpLogStore>,
            Arc::new(MemorySnapshotStore::new()),
        );
        let writer = OpLogWriter::new(
            DeviceId::new("laptop-1"),
            SchemaVersion::new("v1"),
            Arc::new(SequenceAllocator::new()),
            Arc::new(CryptoCodec::new(EncryptionKey::generate())),
            Arc::new(OpLogChunker::new(ChunkerConfig::default())),
            Arc::clone(&bus),
        );
        (writer, oplog, bus)
    }

    #[test]
    fn append_allocates_sequences_in_order() {
        let (writer, oplog, _bus) = writer();

        let a = writer.append(b"first", vec!["note/1".into()]).unwrap();
        let b = writer.append(b"second", vec!["note/2".into()]).unwrap();

        assert_eq!(a.sequence, Sequence::new(1));
        assert_eq!(b.sequence, Sequence::new(2));
        assert!(oplog
            .contains(writer.device_id(), &SchemaVersion::new("v1"), b.sequence)
            .unwrap());
    }

    #[test]
    fn append_publishes_op_log_created() {
        let (writer, _oplog, bus) = writer();

        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event: &Event| sink.lock().push(event.kind()));

        writer.append(b"payload", vec![]).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.as_slice(), &[EventKind::OpLogCreated]);
    }

    #[test]
    fn append_encrypts_payload() {
        let (writer, _oplog, _bus) = writer();
        let entry = writer.append(b"secret", vec![]).unwrap();
        assert_ne!(entry.data, b"secret");
        assert_eq!(entry.iv.len(), crate::crypto::IV_SIZE);
    }

    #[test]
    fn seal_chunk_starts_a_new_chunk() {
        let (writer, _oplog, _bus) = writer();

        let a = writer.append(b"one", vec![]).unwrap();
        writer.seal_chunk();
        let b = writer.append(b"two", vec![]).unwrap();

        assert_ne!(a.chunk_id, b.chunk_id);
    }

    #[test]
    fn snapshot_created_event_seals_the_chunk() {
        let (writer, _oplog, bus) = writer();

        let a = writer.append(b"one", vec![]).unwrap();
        let snapshot = SnapshotDto::new(
            SchemaVersion::new("v1"),
            vec![0u8; 12],
            SnapshotMeta {
                size_bytes: 0,
                entry_count: 0,
                first_sequence: None,
                last_sequence: Some(a.sequence),
            },
            vec![],
            Some(a.sequence),
            None,
        );
        bus.publish(&Event::snapshot_created(snapshot, None));
        let b = writer.append(b"two", vec![]).unwrap();

        assert_ne!(a.chunk_id, b.chunk_id);
    }
}
