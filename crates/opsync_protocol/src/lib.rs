//! # opsync Protocol
//!
//! Wire-stable message contracts and CBOR codecs for the opsync engine.
//!
//! This crate provides:
//! - `Command`, `Event` and `Query` envelopes with closed discriminators
//! - `OpLogDto` for encrypted operation-log entries
//! - `SnapshotDto` for compacted state dumps
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entry;
mod error;
mod messages;
mod snapshot;
mod types;

pub use entry::OpLogDto;
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    now_millis, Command, CommandKind, CommandPayload, Event, EventKind, EventPayload, OpLogPage,
    Query, QueryKind, QueryPayload, QueryResponse, SyncFailureDto,
};
pub use snapshot::{SnapshotDto, SnapshotMeta};
pub use types::{ChunkId, CorrelationId, DeviceId, QueryId, SchemaVersion, Sequence};
