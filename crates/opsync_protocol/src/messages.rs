//! Command, Event and Query envelopes.
//!
//! The wire schemas are fixed: field names are camelCase, discriminators
//! are closed string unions mapped to tagged enums, and optional fields
//! are absent (not null) when unset.

use crate::entry::OpLogDto;
use crate::error::{ProtocolError, ProtocolResult};
use crate::snapshot::SnapshotDto;
use crate::types::{CorrelationId, DeviceId, QueryId, SchemaVersion, Sequence};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn encode_cbor<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(ProtocolError::encode)?;
    Ok(buf)
}

fn decode_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(ProtocolError::decode)
}

/// Discriminator for command messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Append an op-log entry.
    CreateOpLog,
    /// Persist a compacted snapshot.
    CreateSnapshot,
}

impl CommandKind {
    /// Returns the wire discriminator string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::CreateOpLog => "createOpLog",
            CommandKind::CreateSnapshot => "createSnapshot",
        }
    }
}

/// Typed payload of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CommandPayload {
    /// Append an op-log entry.
    #[serde(rename = "createOpLog")]
    CreateOpLog(OpLogDto),
    /// Persist a compacted snapshot.
    #[serde(rename = "createSnapshot")]
    CreateSnapshot(SnapshotDto),
}

impl CommandPayload {
    /// Returns the discriminator for this payload.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::CreateOpLog(_) => CommandKind::CreateOpLog,
            CommandPayload::CreateSnapshot(_) => CommandKind::CreateSnapshot,
        }
    }
}

/// A write intent submitted to the engine.
///
/// Commands carrying a `correlationId` already seen within the retention
/// window are treated as duplicates and short-circuited to the previously
/// produced result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Submission time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Token for idempotent replay detection.
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Typed payload.
    #[serde(flatten)]
    pub payload: CommandPayload,
}

impl Command {
    /// Creates a `createOpLog` command.
    #[must_use]
    pub fn create_op_log(entry: OpLogDto) -> Self {
        Self {
            timestamp: now_millis(),
            correlation_id: None,
            payload: CommandPayload::CreateOpLog(entry),
        }
    }

    /// Creates a `createSnapshot` command.
    #[must_use]
    pub fn create_snapshot(snapshot: SnapshotDto) -> Self {
        Self {
            timestamp: now_millis(),
            correlation_id: None,
            payload: CommandPayload::CreateSnapshot(snapshot),
        }
    }

    /// Attaches a correlation ID for idempotent replay detection.
    #[must_use]
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Returns the discriminator for this command.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}

/// Discriminator for event messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// An op-log entry was appended.
    OpLogCreated,
    /// A snapshot was persisted.
    SnapshotCreated,
    /// A reconciliation epoch failed and needs intervention.
    SyncFailed,
}

impl EventKind {
    /// Returns the wire discriminator string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OpLogCreated => "opLogCreated",
            EventKind::SnapshotCreated => "snapshotCreated",
            EventKind::SyncFailed => "syncFailed",
        }
    }
}

/// Diagnostic payload carried by a `syncFailed` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailureDto {
    /// Device whose reconciliation epoch failed.
    pub device_id: DeviceId,
    /// Schema version of the failed epoch.
    pub schema_version: SchemaVersion,
    /// Reconciliation phase the failure occurred in.
    pub phase: String,
    /// Human-readable diagnostic.
    pub reason: String,
}

/// Typed payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    /// An op-log entry was appended.
    #[serde(rename = "opLogCreated")]
    OpLogCreated(OpLogDto),
    /// A snapshot was persisted.
    #[serde(rename = "snapshotCreated")]
    SnapshotCreated(SnapshotDto),
    /// A reconciliation epoch failed.
    #[serde(rename = "syncFailed")]
    SyncFailed(SyncFailureDto),
}

impl EventPayload {
    /// Returns the discriminator for this payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::OpLogCreated(_) => EventKind::OpLogCreated,
            EventPayload::SnapshotCreated(_) => EventKind::SnapshotCreated,
            EventPayload::SyncFailed(_) => EventKind::SyncFailed,
        }
    }
}

/// A fact notification published to subscribers.
///
/// The optional `correlationId` links back to the originating command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Publication time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Correlation ID of the originating command, if any.
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    /// Typed payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Creates an `opLogCreated` event.
    #[must_use]
    pub fn op_log_created(entry: OpLogDto, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            timestamp: now_millis(),
            correlation_id,
            payload: EventPayload::OpLogCreated(entry),
        }
    }

    /// Creates a `snapshotCreated` event.
    #[must_use]
    pub fn snapshot_created(snapshot: SnapshotDto, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            timestamp: now_millis(),
            correlation_id,
            payload: EventPayload::SnapshotCreated(snapshot),
        }
    }

    /// Creates a `syncFailed` event.
    #[must_use]
    pub fn sync_failed(failure: SyncFailureDto) -> Self {
        Self {
            timestamp: now_millis(),
            correlation_id: None,
            payload: EventPayload::SyncFailed(failure),
        }
    }

    /// Returns the discriminator for this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}

/// Discriminator for query messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Fetch the latest snapshot.
    GetLatestSnapshot,
    /// Fetch op-log entries after a sequence.
    GetOpLogs,
    /// Fetch the sequence of the latest snapshot.
    GetLastSnapshotSequence,
}

impl QueryKind {
    /// Returns the wire discriminator string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::GetLatestSnapshot => "getLatestSnapshot",
            QueryKind::GetOpLogs => "getOpLogs",
            QueryKind::GetLastSnapshotSequence => "getLastSnapshotSequence",
        }
    }
}

/// Typed parameters of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters")]
pub enum QueryPayload {
    /// Fetch the latest snapshot for a schema version.
    #[serde(rename = "getLatestSnapshot")]
    GetLatestSnapshot {
        /// Schema version to query.
        #[serde(rename = "schemaVersion")]
        schema_version: SchemaVersion,
    },
    /// Fetch op-log entries strictly after a sequence.
    #[serde(rename = "getOpLogs")]
    GetOpLogs {
        /// Schema version to query.
        #[serde(rename = "schemaVersion")]
        schema_version: SchemaVersion,
        /// Return entries with a sequence strictly greater than this.
        #[serde(rename = "afterSequence")]
        after_sequence: Sequence,
        /// Maximum number of entries to return.
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },
    /// Fetch the sequence of the latest snapshot for a schema version.
    #[serde(rename = "getLastSnapshotSequence")]
    GetLastSnapshotSequence {
        /// Schema version to query.
        #[serde(rename = "schemaVersion")]
        schema_version: SchemaVersion,
    },
}

impl QueryPayload {
    /// Returns the discriminator for this payload.
    #[must_use]
    pub fn kind(&self) -> QueryKind {
        match self {
            QueryPayload::GetLatestSnapshot { .. } => QueryKind::GetLatestSnapshot,
            QueryPayload::GetOpLogs { .. } => QueryKind::GetOpLogs,
            QueryPayload::GetLastSnapshotSequence { .. } => QueryKind::GetLastSnapshotSequence,
        }
    }
}

/// A read request with no side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Identifier for this query.
    #[serde(rename = "queryId")]
    pub query_id: QueryId,
    /// Submission time, milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Typed parameters.
    #[serde(flatten)]
    pub payload: QueryPayload,
}

impl Query {
    /// Creates a `getLatestSnapshot` query.
    #[must_use]
    pub fn get_latest_snapshot(schema_version: SchemaVersion) -> Self {
        Self {
            query_id: QueryId::generate(),
            timestamp: now_millis(),
            payload: QueryPayload::GetLatestSnapshot { schema_version },
        }
    }

    /// Creates a `getOpLogs` query for entries strictly after `after_sequence`.
    #[must_use]
    pub fn get_op_logs(
        schema_version: SchemaVersion,
        after_sequence: Sequence,
        limit: Option<u32>,
    ) -> Self {
        Self {
            query_id: QueryId::generate(),
            timestamp: now_millis(),
            payload: QueryPayload::GetOpLogs {
                schema_version,
                after_sequence,
                limit,
            },
        }
    }

    /// Creates a `getLastSnapshotSequence` query.
    #[must_use]
    pub fn get_last_snapshot_sequence(schema_version: SchemaVersion) -> Self {
        Self {
            query_id: QueryId::generate(),
            timestamp: now_millis(),
            payload: QueryPayload::GetLastSnapshotSequence { schema_version },
        }
    }

    /// Returns the discriminator for this query.
    #[must_use]
    pub fn kind(&self) -> QueryKind {
        self.payload.kind()
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}

/// A page of op-log entries returned by `getOpLogs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpLogPage {
    /// Entries ordered by sequence.
    pub entries: Vec<OpLogDto>,
    /// Whether more entries remain past this page.
    pub has_more: bool,
}

impl OpLogPage {
    /// Creates a page of entries.
    #[must_use]
    pub fn new(entries: Vec<OpLogDto>, has_more: bool) -> Self {
        Self { entries, has_more }
    }

    /// Creates an empty final page.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            has_more: false,
        }
    }
}

/// Typed response to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum QueryResponse {
    /// Response to `getLatestSnapshot`.
    #[serde(rename = "latestSnapshot")]
    LatestSnapshot(Option<SnapshotDto>),
    /// Response to `getOpLogs`.
    #[serde(rename = "opLogs")]
    OpLogs(OpLogPage),
    /// Response to `getLastSnapshotSequence`.
    #[serde(rename = "lastSnapshotSequence")]
    LastSnapshotSequence(Option<Sequence>),
}

impl QueryResponse {
    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_cbor(self)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        decode_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkId, DeviceId};
    use crate::SnapshotMeta;

    fn sample_entry(seq: u64) -> OpLogDto {
        let device = DeviceId::new("laptop-1");
        OpLogDto::new(
            device.clone(),
            ChunkId::derive(&device, Sequence::new(seq)),
            SchemaVersion::new("v1"),
            Sequence::new(seq),
            vec![0u8; 12],
            vec![1, 2, 3],
            vec!["notes/1".into()],
        )
    }

    fn sample_snapshot() -> SnapshotDto {
        SnapshotDto::new(
            SchemaVersion::new("v1"),
            vec![2u8; 12],
            SnapshotMeta {
                size_bytes: 3,
                entry_count: 1,
                first_sequence: Some(Sequence::new(1)),
                last_sequence: Some(Sequence::new(1)),
            },
            vec![7, 7, 7],
            Some(Sequence::new(1)),
            Some(1_700_000_000_000),
        )
    }

    #[test]
    fn command_roundtrip() {
        let cmd = Command::create_op_log(sample_entry(1))
            .with_correlation_id(CorrelationId::generate());
        let bytes = cmd.encode().unwrap();
        let decoded = Command::decode(&bytes).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.kind(), CommandKind::CreateOpLog);
    }

    #[test]
    fn command_wire_shape() {
        let cmd = Command::create_snapshot(sample_snapshot());
        let json = serde_json::to_value(&cmd).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj["type"], "createSnapshot");
        assert!(obj.contains_key("timestamp"));
        assert!(obj.contains_key("data"));
        // No correlation ID attached: the field is absent, not null.
        assert!(!obj.contains_key("correlationId"));
    }

    #[test]
    fn event_roundtrip() {
        let corr = CorrelationId::generate();
        let event = Event::op_log_created(sample_entry(3), Some(corr));
        let bytes = event.encode().unwrap();
        let decoded = Event::decode(&bytes).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.correlation_id, Some(corr));
        assert_eq!(decoded.kind(), EventKind::OpLogCreated);
    }

    #[test]
    fn sync_failed_event_wire_shape() {
        let event = Event::sync_failed(SyncFailureDto {
            device_id: DeviceId::new("laptop-1"),
            schema_version: SchemaVersion::new("v1"),
            phase: "pulling".into(),
            reason: "sequence gap".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "syncFailed");
        assert_eq!(json["data"]["deviceId"], "laptop-1");
        assert_eq!(json["data"]["reason"], "sequence gap");
    }

    #[test]
    fn query_roundtrip() {
        let query = Query::get_op_logs(SchemaVersion::new("v1"), Sequence::new(2), Some(100));
        let bytes = query.encode().unwrap();
        let decoded = Query::decode(&bytes).unwrap();
        assert_eq!(decoded, query);
        assert_eq!(decoded.kind(), QueryKind::GetOpLogs);
    }

    #[test]
    fn query_wire_shape() {
        let query = Query::get_last_snapshot_sequence(SchemaVersion::new("v2"));
        let json = serde_json::to_value(&query).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj["type"], "getLastSnapshotSequence");
        assert!(obj.contains_key("queryId"));
        assert!(obj.contains_key("timestamp"));
        assert_eq!(obj["parameters"]["schemaVersion"], "v2");
    }

    #[test]
    fn discriminator_strings() {
        assert_eq!(CommandKind::CreateOpLog.as_str(), "createOpLog");
        assert_eq!(CommandKind::CreateSnapshot.as_str(), "createSnapshot");
        assert_eq!(EventKind::OpLogCreated.as_str(), "opLogCreated");
        assert_eq!(EventKind::SnapshotCreated.as_str(), "snapshotCreated");
        assert_eq!(EventKind::SyncFailed.as_str(), "syncFailed");
        assert_eq!(QueryKind::GetLatestSnapshot.as_str(), "getLatestSnapshot");
        assert_eq!(QueryKind::GetOpLogs.as_str(), "getOpLogs");
        assert_eq!(
            QueryKind::GetLastSnapshotSequence.as_str(),
            "getLastSnapshotSequence"
        );
    }

    #[test]
    fn query_response_roundtrip() {
        let response = QueryResponse::OpLogs(OpLogPage::new(vec![sample_entry(1)], true));
        let bytes = response.encode().unwrap();
        let decoded = QueryResponse::decode(&bytes).unwrap();
        assert_eq!(decoded, response);

        let response = QueryResponse::LastSnapshotSequence(Some(Sequence::new(9)));
        let bytes = response.encode().unwrap();
        let decoded = QueryResponse::decode(&bytes).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}
