//! Store-backed command and query handlers.

use crate::bus::{DispatchOutcome, MessageBus};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::store::{OpLogStore, SnapshotStore};
use opsync_protocol::{
    Command, CommandKind, CommandPayload, Event, OpLogPage, Query, QueryKind, QueryPayload,
    QueryResponse, Sequence,
};
use std::sync::Arc;

/// Wires a message bus to an op-log store and a snapshot store.
///
/// A node answers the full protocol surface: `createOpLog` and
/// `createSnapshot` commands mutate the stores and produce their
/// events; the three queries read them. Both a local device and an
/// in-memory remote are nodes — the protocol is symmetric.
pub struct SyncNode {
    bus: Arc<MessageBus>,
    oplog: Arc<dyn OpLogStore>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl SyncNode {
    /// Creates a node and registers its handlers on the bus.
    pub fn install(
        bus: Arc<MessageBus>,
        oplog: Arc<dyn OpLogStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            bus: Arc::clone(&bus),
            oplog,
            snapshots,
        });

        let handler = Arc::clone(&node);
        bus.register_command_handler(
            CommandKind::CreateOpLog,
            Arc::new(move |cmd: &Command| handler.handle_command(cmd)),
        );
        let handler = Arc::clone(&node);
        bus.register_command_handler(
            CommandKind::CreateSnapshot,
            Arc::new(move |cmd: &Command| handler.handle_command(cmd)),
        );

        for kind in [
            QueryKind::GetLatestSnapshot,
            QueryKind::GetOpLogs,
            QueryKind::GetLastSnapshotSequence,
        ] {
            let handler = Arc::clone(&node);
            bus.register_query_handler(
                kind,
                Arc::new(move |query: &Query| handler.handle_query(query)),
            );
        }

        node
    }

    /// Creates a node on a fresh bus whose replay-cache capacity comes
    /// from the engine configuration, and registers its handlers.
    pub fn with_config(
        config: &EngineConfig,
        oplog: Arc<dyn OpLogStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Arc<Self> {
        let bus = Arc::new(MessageBus::new(config.dedup_capacity));
        Self::install(bus, oplog, snapshots)
    }

    /// Returns the bus this node is installed on.
    #[must_use]
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    fn handle_command(&self, command: &Command) -> EngineResult<DispatchOutcome> {
        match &command.payload {
            CommandPayload::CreateOpLog(entry) => {
                // Resent chunks carry entries the store may already hold;
                // storing an entry twice is a no-op, not a failure.
                let known = self.oplog.contains(
                    &entry.device_id,
                    &entry.schema_version,
                    entry.sequence,
                )?;
                if !known {
                    self.oplog.append(entry.clone())?;
                }
                Ok(DispatchOutcome::Event(Event::op_log_created(
                    entry.clone(),
                    command.correlation_id,
                )))
            }
            CommandPayload::CreateSnapshot(snapshot) => {
                self.snapshots.put(snapshot.clone())?;
                Ok(DispatchOutcome::Event(Event::snapshot_created(
                    snapshot.clone(),
                    command.correlation_id,
                )))
            }
        }
    }

    fn handle_query(&self, query: &Query) -> EngineResult<QueryResponse> {
        match &query.payload {
            QueryPayload::GetLatestSnapshot { schema_version } => Ok(
                QueryResponse::LatestSnapshot(self.snapshots.latest(schema_version)?),
            ),
            QueryPayload::GetOpLogs {
                schema_version,
                after_sequence,
                limit,
            } => {
                let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
                // Fetch one past the limit to learn whether more remain.
                let probe = limit.saturating_add(1);
                let mut entries =
                    self.oplog
                        .entries_after(schema_version, *after_sequence, probe)?;
                let has_more = entries.len() > limit;
                if has_more {
                    // Pullers advance their cursor by sequence, so a page must
                    // never split entries sharing a sequence across devices.
                    let split_seq = entries[limit].sequence;
                    entries.truncate(limit);
                    if entries.first().map(|e| e.sequence) == Some(split_seq) {
                        // The whole page sits at one sequence; return the
                        // complete group so the puller can make progress.
                        entries = self
                            .oplog
                            .entries_after(schema_version, *after_sequence, usize::MAX)?;
                        entries.retain(|e| e.sequence == split_seq);
                    } else {
                        entries.retain(|e| e.sequence != split_seq);
                    }
                }
                Ok(QueryResponse::OpLogs(OpLogPage::new(entries, has_more)))
            }
            QueryPayload::GetLastSnapshotSequence { schema_version } => {
                let sequence = self
                    .snapshots
                    .latest(schema_version)?
                    .and_then(|s| s.sequence);
                Ok(QueryResponse::LastSnapshotSequence(sequence))
            }
        }
    }

    /// Returns the last snapshot sequence for a schema, `Sequence(0)` when
    /// no snapshot exists.
    pub fn snapshot_floor(
        &self,
        schema: &opsync_protocol::SchemaVersion,
    ) -> EngineResult<Sequence> {
        Ok(self
            .snapshots
            .latest(schema)?
            .and_then(|s| s.sequence)
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for SyncNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncNode").finish_non_exhaustive()
    }
}
