//! Op-log and snapshot storage seams.
//!
//! Persistence is the embedding application's concern; the engine talks
//! to these traits only. In-memory implementations back tests and serve
//! as reference semantics.

use crate::error::{EngineError, EngineResult};
use opsync_protocol::{DeviceId, OpLogDto, SchemaVersion, Sequence, SnapshotDto};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Storage for op-log entries.
///
/// All mutation goes through serialized append or compaction-driven
/// pruning, never direct overwrite.
pub trait OpLogStore: Send + Sync {
    /// Appends an entry to the journal.
    ///
    /// While the journal holds entries, appends for one device must be
    /// contiguous: the sequence must directly follow the last stored one.
    /// An empty journal accepts any start above the pruned floor, because
    /// the skipped prefix is covered by a snapshot the store never sees:
    /// a fresh journal bootstrapped from a pulled snapshot, or a pruned
    /// journal resuming past a newer snapshot's coverage. Continuity of
    /// a pulled batch is the reconciler's check, not the store's.
    fn append(&self, entry: OpLogDto) -> EngineResult<()>;

    /// Returns entries with a sequence strictly greater than `after`,
    /// ordered by sequence, up to `limit`.
    fn entries_after(
        &self,
        schema: &SchemaVersion,
        after: Sequence,
        limit: usize,
    ) -> EngineResult<Vec<OpLogDto>>;

    /// Returns the last stored sequence for a device, if any.
    fn last_sequence(
        &self,
        device: &DeviceId,
        schema: &SchemaVersion,
    ) -> EngineResult<Option<Sequence>>;

    /// Returns true if an entry from `device` at `sequence` is stored.
    fn contains(
        &self,
        device: &DeviceId,
        schema: &SchemaVersion,
        sequence: Sequence,
    ) -> EngineResult<bool>;

    /// Returns entries not yet acknowledged by the remote, in sequence
    /// order, up to `limit`.
    fn pending_push(
        &self,
        device: &DeviceId,
        schema: &SchemaVersion,
        limit: usize,
    ) -> EngineResult<Vec<OpLogDto>>;

    /// Marks entries up to and including `sequence` as acknowledged.
    fn acknowledge_up_to(
        &self,
        device: &DeviceId,
        schema: &SchemaVersion,
        sequence: Sequence,
    ) -> EngineResult<()>;

    /// Retires entries up to and including `sequence` after they were
    /// folded into a snapshot. Returns the number of entries removed.
    fn prune_up_to(
        &self,
        device: &DeviceId,
        schema: &SchemaVersion,
        sequence: Sequence,
    ) -> EngineResult<usize>;

    /// Returns the number of entries awaiting acknowledgment.
    fn pending_count(&self, device: &DeviceId, schema: &SchemaVersion) -> EngineResult<usize>;
}

/// Storage for snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Persists a snapshot. A snapshot with a lower sequence than the
    /// stored one never supersedes it.
    fn put(&self, snapshot: SnapshotDto) -> EngineResult<()>;

    /// Returns the latest snapshot for a schema version, if any.
    fn latest(&self, schema: &SchemaVersion) -> EngineResult<Option<SnapshotDto>>;
}

#[derive(Debug, Default)]
struct DeviceJournal {
    entries: BTreeMap<u64, OpLogDto>,
    acked: u64,
    floor: u64,
}

/// In-memory op-log store.
#[derive(Debug, Default)]
pub struct MemoryOpLogStore {
    journals: RwLock<HashMap<(DeviceId, SchemaVersion), DeviceJournal>>,
}

impl MemoryOpLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of stored entries across all journals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.journals.read().values().map(|j| j.entries.len()).sum()
    }

    /// Returns true if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OpLogStore for MemoryOpLogStore {
    fn append(&self, entry: OpLogDto) -> EngineResult<()> {
        let mut journals = self.journals.write();
        let journal = journals
            .entry((entry.device_id.clone(), entry.schema_version.clone()))
            .or_default();

        let seq = entry.sequence.as_u64();
        if let Some((&last, _)) = journal.entries.iter().next_back() {
            if seq != last + 1 {
                return Err(EngineError::SequenceGap {
                    device: entry.device_id.clone(),
                    expected: Sequence::new(last + 1),
                    found: entry.sequence,
                });
            }
        } else if seq <= journal.floor {
            return Err(EngineError::SequenceGap {
                device: entry.device_id.clone(),
                expected: Sequence::new(journal.floor + 1),
                found: entry.sequence,
            });
        }

        journal.entries.insert(seq, entry);
        Ok(())
    }

    fn entries_after(
        &self,
        schema: &SchemaVersion,
        after: Sequence,
        limit: usize,
    ) -> EngineResult<Vec<OpLogDto>> {
        let journals = self.journals.read();
        let mut result: Vec<OpLogDto> = journals
            .iter()
            .filter(|((_, s), _)| s == schema)
            .flat_map(|(_, journal)| {
                journal
                    .entries
                    .range(after.as_u64() + 1..)
                    .map(|(_, e)| e.clone())
            })
            .collect();

        result.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        result.truncate(limit);
        Ok(result)
    }

    fn last_sequence(
        &self,
        device: &DeviceId,
        schema: &SchemaVersion,
    ) -> EngineResult<Option<Sequence>> {
        let journals = self.journals.read();
        Ok(journals
            .get(&(device.clone(), schema.clone()))
            .and_then(|j| j.entries.keys().next_back().copied())
            .map(Sequence::new))
    }

    fn contains(
        &self,
        device: &DeviceId,
        schema: &SchemaVersion,
        sequence: Sequence,
    ) -> EngineResult<bool> {
        let journals = self.journals.read();
        Ok(journals
            .get(&(device.clone(), schema.clone()))
            .is_some_and(|j| {
                j.entries.contains_key(&sequence.as_u64()) || sequence.as_u64() <= j.floor
            }))
    }

    fn pending_push(
        &self,
        device: &DeviceId,
        schema: &SchemaVersion,
        limit: usize,
    ) -> EngineResult<Vec<OpLogDto>> {
        let journals = self.journals.read();
        Ok(journals
            .get(&(device.clone(), schema.clone()))
            .map(|j| {
                j.entries
                    .range(j.acked + 1..)
                    .take(limit)
                    .map(|(_, e)| e.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn acknowledge_up_to(
        &self,
        device: &DeviceId,
        schema: &SchemaVersion,
        sequence: Sequence,
    ) -> EngineResult<()> {
        let mut journals = self.journals.write();
        let journal = journals
            .entry((device.clone(), schema.clone()))
            .or_default();
        journal.acked = journal.acked.max(sequence.as_u64());
        Ok(())
    }

    fn prune_up_to(
        &self,
        device: &DeviceId,
        schema: &SchemaVersion,
        sequence: Sequence,
    ) -> EngineResult<usize> {
        let mut journals = self.journals.write();
        let Some(journal) = journals.get_mut(&(device.clone(), schema.clone())) else {
            return Ok(0);
        };

        let keep = journal.entries.split_off(&(sequence.as_u64() + 1));
        let removed = journal.entries.len();
        journal.entries = keep;
        journal.floor = journal.floor.max(sequence.as_u64());
        Ok(removed)
    }

    fn pending_count(&self, device: &DeviceId, schema: &SchemaVersion) -> EngineResult<usize> {
        let journals = self.journals.read();
        Ok(journals
            .get(&(device.clone(), schema.clone()))
            .map(|j| j.entries.range(j.acked + 1..).count())
            .unwrap_or(0))
    }
}

/// In-memory snapshot store keeping the latest snapshot per schema version.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<SchemaVersion, SnapshotDto>>,
}

impl MemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn put(&self, snapshot: SnapshotDto) -> EngineResult<()> {
        let mut snapshots = self.snapshots.write();
        match snapshots.get(&snapshot.schema_version) {
            Some(existing) if existing.sequence >= snapshot.sequence => {
                // A stale snapshot never supersedes a newer one.
                Ok(())
            }
            _ => {
                snapshots.insert(snapshot.schema_version.clone(), snapshot);
                Ok(())
            }
        }
    }

    fn latest(&self, schema: &SchemaVersion) -> EngineResult<Option<SnapshotDto>> {
        Ok(self.snapshots.read().get(schema).cloned())
    }
}
