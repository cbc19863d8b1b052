//! Snapshot compaction.

use crate::crypto::CryptoCodec;
use crate::error::{EngineError, EngineResult};
use opsync_protocol::{
    now_millis, DeviceId, OpLogDto, Sequence, SnapshotDto, SnapshotMeta,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A decrypted record held in the folded state, tagged with the writer
/// that produced it for last-writer-wins ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Sequence of the entry that last wrote this key.
    pub sequence: Sequence,
    /// Device that produced the winning write.
    pub device: DeviceId,
    /// Decrypted record payload.
    pub data: Vec<u8>,
}

/// The decrypted full-state fold of a snapshot.
///
/// Keys are query keys; the value per key is the record written by the
/// winning entry under last-writer-wins ordered by `(sequence, device)`.
/// Applying the same set of entries in any order yields the same state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    records: BTreeMap<String, StateRecord>,
}

impl SnapshotState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a decrypted entry under last-writer-wins.
    ///
    /// For every query key the entry affects, the write wins if its
    /// `(sequence, device)` pair is at or above the current holder's.
    pub fn apply(&mut self, sequence: Sequence, device: &DeviceId, keys: &[String], data: &[u8]) {
        for key in keys {
            let wins = match self.records.get(key) {
                Some(existing) => {
                    (sequence, device) >= (existing.sequence, &existing.device)
                }
                None => true,
            };
            if wins {
                self.records.insert(
                    key.clone(),
                    StateRecord {
                        sequence,
                        device: device.clone(),
                        data: data.to_vec(),
                    },
                );
            }
        }
    }

    /// Returns the winning record for a query key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&StateRecord> {
        self.records.get(key)
    }

    /// Returns the number of keys held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no keys are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Compacts op-log entries into snapshots.
///
/// The output is built fully in memory and returned; persisting it is a
/// single store insert, so a snapshot is written atomically or not at
/// all.
pub struct SnapshotManager {
    crypto: Arc<CryptoCodec>,
}

impl SnapshotManager {
    /// Creates a manager using the given codec for dumps and entries.
    #[must_use]
    pub fn new(crypto: Arc<CryptoCodec>) -> Self {
        Self { crypto }
    }

    /// Decrypts and decodes a snapshot's state dump.
    pub fn decode_state(&self, snapshot: &SnapshotDto) -> EngineResult<SnapshotState> {
        let plain = self.crypto.decrypt(&snapshot.iv, &snapshot.dump)?;
        ciborium::from_reader(plain.as_slice())
            .map_err(|e| EngineError::decryption_failed(format!("malformed state dump: {e}")))
    }

    fn encode_state(
        &self,
        state: &SnapshotState,
        schema: opsync_protocol::SchemaVersion,
        folded: &[&OpLogDto],
    ) -> EngineResult<SnapshotDto> {
        let mut plain = Vec::new();
        ciborium::into_writer(state, &mut plain)
            .map_err(|e| EngineError::encryption_failed(format!("state dump encode: {e}")))?;
        let (iv, dump) = self.crypto.encrypt(&plain)?;

        let first = folded.iter().map(|e| e.sequence).min();
        let last = folded.iter().map(|e| e.sequence).max();

        let meta = SnapshotMeta {
            size_bytes: dump.len() as u64,
            entry_count: folded.len() as u64,
            first_sequence: first,
            last_sequence: last,
        };

        Ok(SnapshotDto::new(
            schema,
            iv,
            meta,
            dump,
            last,
            Some(now_millis()),
        ))
    }

    /// Compacts op-log entries on top of an optional base snapshot.
    ///
    /// Entries are folded in `(sequence, deviceId)` order under
    /// last-writer-wins on their query keys; the output snapshot's
    /// sequence is the maximum folded sequence. An entry at or below the
    /// base's sequence is rejected as already compacted. With a base and
    /// no entries the base is returned unchanged.
    pub fn compact(
        &self,
        base: Option<&SnapshotDto>,
        entries: &[OpLogDto],
    ) -> EngineResult<SnapshotDto> {
        if entries.is_empty() {
            return match base {
                Some(snapshot) => Ok(snapshot.clone()),
                None => Err(EngineError::invalid_operation(
                    "nothing to compact: no base snapshot and no entries",
                )),
            };
        }

        let schema = base
            .map(|s| s.schema_version.clone())
            .unwrap_or_else(|| entries[0].schema_version.clone());

        for entry in entries {
            if entry.schema_version != schema {
                return Err(EngineError::SchemaVersionMismatch {
                    expected: schema,
                    found: entry.schema_version.clone(),
                });
            }
            if let Some(snapshot) = base {
                if snapshot.covers(entry.sequence) {
                    return Err(EngineError::AlreadyCompacted {
                        sequence: entry.sequence,
                        snapshot: snapshot.sequence.unwrap_or_default(),
                    });
                }
            }
        }

        let mut state = match base {
            Some(snapshot) => self.decode_state(snapshot)?,
            None => SnapshotState::new(),
        };

        let mut ordered: Vec<&OpLogDto> = entries.iter().collect();
        ordered.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });

        for entry in &ordered {
            let plain = self.crypto.decrypt(&entry.iv, &entry.data)?;
            state.apply(entry.sequence, &entry.device_id, &entry.query_keys, &plain);
        }

        let snapshot = self.encode_state(&state, schema, &ordered)?;
        tracing::debug!(
            sequence = ?snapshot.sequence,
            entries = ordered.len(),
            keys = state.len(),
            "compacted op-log entries into snapshot"
        );
        Ok(snapshot)
    }
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager").finish_non_exhaustive()
    }
}

/// Decides when a device's pending entries warrant a compaction.
///
/// The policy is an external decision, not hardwired into the manager.
pub trait CompactionPolicy: Send + Sync {
    /// Returns true if compaction should run now.
    fn should_compact(&self, pending_entries: usize, since_last: Option<Duration>) -> bool;
}

/// Compacts when either an entry-count threshold or an age threshold is
/// exceeded.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    /// Compact once this many entries are pending.
    pub max_pending: usize,
    /// Compact once this much time has passed since the last compaction.
    pub max_age: Option<Duration>,
}

impl ThresholdPolicy {
    /// Creates a count-only threshold policy.
    #[must_use]
    pub fn entries(max_pending: usize) -> Self {
        Self {
            max_pending,
            max_age: None,
        }
    }

    /// Adds an age threshold.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

impl CompactionPolicy for ThresholdPolicy {
    fn should_compact(&self, pending_entries: usize, since_last: Option<Duration>) -> bool {
        if pending_entries == 0 {
            return false;
        }
        if pending_entries >= self.max_pending {
            return true;
        }
        match (self.max_age, since_last) {
            (Some(max_age), Some(elapsed)) => elapsed >= max_age,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use opsync_protocol::{ChunkId, SchemaVersion};
    use proptest::prelude::*;

    fn codec() -> Arc<CryptoCodec> {
        Arc::new(CryptoCodec::new(EncryptionKey::generate()))
    }

    fn entry(
        crypto: &CryptoCodec,
        device: &str,
        seq: u64,
        keys: &[&str],
        payload: &[u8],
    ) -> OpLogDto {
        let device = DeviceId::new(device);
        let (iv, data) = crypto.encrypt(payload).unwrap();
        OpLogDto::new(
            device.clone(),
            ChunkId::derive(&device, Sequence::new(seq)),
            SchemaVersion::new("v1"),
            Sequence::new(seq),
            iv,
            data,
            keys.iter().map(|k| k.to_string()).collect(),
        )
    }

    #[test]
    fn compact_from_empty_base() {
        let crypto = codec();
        let manager = SnapshotManager::new(Arc::clone(&crypto));

        let entries = vec![
            entry(&crypto, "a", 1, &["notes/1"], b"first"),
            entry(&crypto, "a", 2, &["notes/2"], b"second"),
        ];

        let snapshot = manager.compact(None, &entries).unwrap();
        assert_eq!(snapshot.sequence, Some(Sequence::new(2)));
        assert_eq!(snapshot.meta.entry_count, 2);
        assert_eq!(snapshot.meta.first_sequence, Some(Sequence::new(1)));
        assert_eq!(snapshot.meta.last_sequence, Some(Sequence::new(2)));

        let state = manager.decode_state(&snapshot).unwrap();
        assert_eq!(state.get("notes/1").unwrap().data, b"first");
        assert_eq!(state.get("notes/2").unwrap().data, b"second");
    }

    #[test]
    fn later_sequence_wins_per_key() {
        let crypto = codec();
        let manager = SnapshotManager::new(Arc::clone(&crypto));

        let entries = vec![
            entry(&crypto, "a", 1, &["notes/1"], b"old"),
            entry(&crypto, "a", 2, &["notes/1"], b"new"),
        ];

        let snapshot = manager.compact(None, &entries).unwrap();
        let state = manager.decode_state(&snapshot).unwrap();
        assert_eq!(state.get("notes/1").unwrap().data, b"new");
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn compact_on_top_of_base() {
        let crypto = codec();
        let manager = SnapshotManager::new(Arc::clone(&crypto));

        let base = manager
            .compact(None, &[entry(&crypto, "a", 1, &["notes/1"], b"v1")])
            .unwrap();

        let next = manager
            .compact(Some(&base), &[entry(&crypto, "a", 2, &["notes/2"], b"v2")])
            .unwrap();

        assert_eq!(next.sequence, Some(Sequence::new(2)));
        let state = manager.decode_state(&next).unwrap();
        assert_eq!(state.get("notes/1").unwrap().data, b"v1");
        assert_eq!(state.get("notes/2").unwrap().data, b"v2");
    }

    #[test]
    fn replay_of_covered_entries_is_rejected() {
        let crypto = codec();
        let manager = SnapshotManager::new(Arc::clone(&crypto));

        let base = manager
            .compact(
                None,
                &[
                    entry(&crypto, "a", 1, &["k"], b"1"),
                    entry(&crypto, "a", 2, &["k"], b"2"),
                ],
            )
            .unwrap();

        let err = manager
            .compact(Some(&base), &[entry(&crypto, "a", 2, &["k"], b"replay")])
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyCompacted { .. }));
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let crypto = codec();
        let manager = SnapshotManager::new(Arc::clone(&crypto));

        let base = manager
            .compact(None, &[entry(&crypto, "a", 1, &["k"], b"1")])
            .unwrap();

        let mut incompatible = entry(&crypto, "a", 2, &["k"], b"2");
        incompatible.schema_version = SchemaVersion::new("v2");

        let err = manager.compact(Some(&base), &[incompatible]).unwrap_err();
        assert!(matches!(err, EngineError::SchemaVersionMismatch { .. }));
    }

    #[test]
    fn empty_batch_returns_base_unchanged() {
        let crypto = codec();
        let manager = SnapshotManager::new(Arc::clone(&crypto));

        let base = manager
            .compact(None, &[entry(&crypto, "a", 1, &["k"], b"1")])
            .unwrap();

        let same = manager.compact(Some(&base), &[]).unwrap();
        assert_eq!(same, base);
    }

    #[test]
    fn empty_batch_without_base_is_invalid() {
        let manager = SnapshotManager::new(codec());
        assert!(manager.compact(None, &[]).is_err());
    }

    #[test]
    fn wrong_key_cannot_decode_dump() {
        let crypto = codec();
        let manager = SnapshotManager::new(Arc::clone(&crypto));
        let snapshot = manager
            .compact(None, &[entry(&crypto, "a", 1, &["k"], b"1")])
            .unwrap();

        let other = SnapshotManager::new(codec());
        let err = other.decode_state(&snapshot).unwrap_err();
        assert!(matches!(err, EngineError::DecryptionFailed { .. }));
    }

    #[test]
    fn threshold_policy() {
        let policy = ThresholdPolicy::entries(10).with_max_age(Duration::from_secs(60));

        assert!(!policy.should_compact(0, Some(Duration::from_secs(600))));
        assert!(!policy.should_compact(5, Some(Duration::from_secs(1))));
        assert!(policy.should_compact(10, None));
        assert!(policy.should_compact(1, Some(Duration::from_secs(61))));
    }

    proptest! {
        #[test]
        fn fold_order_does_not_matter(
            order in Just((0usize..6).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let crypto = codec();
            let manager = SnapshotManager::new(Arc::clone(&crypto));

            let entries = vec![
                entry(&crypto, "a", 1, &["x"], b"a1"),
                entry(&crypto, "b", 1, &["x", "y"], b"b1"),
                entry(&crypto, "a", 2, &["y"], b"a2"),
                entry(&crypto, "b", 2, &["z"], b"b2"),
                entry(&crypto, "a", 3, &["x"], b"a3"),
                entry(&crypto, "b", 3, &["z", "y"], b"b3"),
            ];
            let shuffled: Vec<OpLogDto> =
                order.iter().map(|&i| entries[i].clone()).collect();

            let forward = manager.compact(None, &entries).unwrap();
            let reordered = manager.compact(None, &shuffled).unwrap();

            let state_a = manager.decode_state(&forward).unwrap();
            let state_b = manager.decode_state(&reordered).unwrap();
            prop_assert_eq!(state_a, state_b);
        }
    }
}
