//! # opsync Engine
//!
//! Local-first synchronization engine built on an encrypted operation
//! log. Every mutation becomes an immutable, AES-256-GCM-encrypted
//! op-log entry with a gap-free per-device sequence; entries replicate
//! between devices through pull/merge/push reconciliation cycles and are
//! periodically folded into snapshots so the log stays bounded.
//!
//! The moving parts:
//! - [`MessageBus`] routes `Command`/`Event`/`Query` values between
//!   components, with correlation-ID replay detection
//! - [`OpLogWriter`] turns local mutations into journal entries
//! - [`SyncReconciler`] runs the `Idle → Pulling → Reconciling → Pushing`
//!   cycle against a [`RemoteStore`]
//! - [`SnapshotManager`] folds entries into encrypted snapshots under
//!   last-writer-wins, keyed by query keys
//!
//! Persistence is pluggable through the [`OpLogStore`] and
//! [`SnapshotStore`] traits; in-memory implementations are provided.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod chunker;
pub mod config;
pub mod crypto;
pub mod error;
pub mod node;
pub mod reconciler;
pub mod remote;
pub mod sequence;
pub mod snapshot;
pub mod store;
pub mod writer;

pub use bus::{CommandHandler, DispatchOutcome, MessageBus, QueryHandler};
pub use chunker::OpLogChunker;
pub use config::{ChunkerConfig, EngineConfig, RetryConfig};
pub use crypto::{CryptoCodec, EncryptionKey, IV_SIZE, KEY_SIZE, TAG_SIZE};
pub use error::{EngineError, EngineResult};
pub use node::SyncNode;
pub use reconciler::{SyncCycleReport, SyncReconciler, SyncState, SyncStats};
pub use remote::{InMemoryRemote, RemoteStore};
pub use sequence::SequenceAllocator;
pub use snapshot::{CompactionPolicy, SnapshotManager, SnapshotState, StateRecord, ThresholdPolicy};
pub use store::{MemoryOpLogStore, MemorySnapshotStore, OpLogStore, SnapshotStore};
pub use writer::OpLogWriter;
