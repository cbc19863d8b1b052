//! Grouping of op-log entries into bounded transport chunks.

use crate::config::ChunkerConfig;
use opsync_protocol::{ChunkId, DeviceId, Sequence};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug)]
struct OpenChunk {
    id: ChunkId,
    entries: usize,
    bytes: usize,
}

/// Assigns consecutive op-log entries to bounded chunks.
///
/// Chunks are bounded by a maximum entry count and a maximum total
/// payload size. The chunk ID is derived from `(deviceId, first sequence
/// in chunk)`, so assignment is deterministic given the same entry
/// stream and limits, which makes resends idempotent. An entry is never
/// split: a payload larger than the byte limit gets a chunk of its own.
#[derive(Debug)]
pub struct OpLogChunker {
    config: ChunkerConfig,
    open: Mutex<HashMap<DeviceId, OpenChunk>>,
}

impl OpLogChunker {
    /// Creates a chunker with the given limits.
    #[must_use]
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Assigns the chunk for the entry at `sequence` with the given
    /// payload size.
    ///
    /// Entries must be presented in sequence order per device; the
    /// caller (the op-log writer) serializes appends per device.
    pub fn assign(&self, device: &DeviceId, sequence: Sequence, payload_len: usize) -> ChunkId {
        let mut open = self.open.lock();

        if let Some(chunk) = open.get_mut(device) {
            let fits = chunk.entries < self.config.max_entries
                && chunk.bytes + payload_len <= self.config.max_bytes;
            if fits {
                chunk.entries += 1;
                chunk.bytes += payload_len;
                return chunk.id.clone();
            }
        }

        let id = ChunkId::derive(device, sequence);
        open.insert(
            device.clone(),
            OpenChunk {
                id: id.clone(),
                entries: 1,
                bytes: payload_len,
            },
        );
        id
    }

    /// Closes the open chunk for a device.
    ///
    /// Called at a compaction boundary: a chunk never spans one. The
    /// next assigned entry starts a fresh chunk.
    pub fn seal(&self, device: &DeviceId) {
        self.open.lock().remove(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn device() -> DeviceId {
        DeviceId::new("laptop-1")
    }

    #[test]
    fn entries_share_a_chunk_until_count_limit() {
        let chunker = OpLogChunker::new(ChunkerConfig::new(3, 1024));
        let dev = device();

        let c1 = chunker.assign(&dev, Sequence::new(1), 10);
        let c2 = chunker.assign(&dev, Sequence::new(2), 10);
        let c3 = chunker.assign(&dev, Sequence::new(3), 10);
        let c4 = chunker.assign(&dev, Sequence::new(4), 10);

        assert_eq!(c1, c2);
        assert_eq!(c2, c3);
        assert_ne!(c3, c4);
        assert_eq!(c1.as_str(), "laptop-1:1");
        assert_eq!(c4.as_str(), "laptop-1:4");
    }

    #[test]
    fn byte_limit_starts_new_chunk() {
        let chunker = OpLogChunker::new(ChunkerConfig::new(100, 25));
        let dev = device();

        let c1 = chunker.assign(&dev, Sequence::new(1), 10);
        let c2 = chunker.assign(&dev, Sequence::new(2), 10);
        // 10 + 10 + 10 > 25, so entry 3 starts a new chunk
        let c3 = chunker.assign(&dev, Sequence::new(3), 10);

        assert_eq!(c1, c2);
        assert_ne!(c2, c3);
    }

    #[test]
    fn oversized_entry_gets_its_own_chunk() {
        let chunker = OpLogChunker::new(ChunkerConfig::new(100, 25));
        let dev = device();

        let c1 = chunker.assign(&dev, Sequence::new(1), 1000);
        let c2 = chunker.assign(&dev, Sequence::new(2), 10);

        assert_eq!(c1.as_str(), "laptop-1:1");
        assert_ne!(c1, c2);
    }

    #[test]
    fn seal_closes_chunk_at_compaction_boundary() {
        let chunker = OpLogChunker::new(ChunkerConfig::new(100, 1024));
        let dev = device();

        let c1 = chunker.assign(&dev, Sequence::new(1), 10);
        chunker.seal(&dev);
        let c2 = chunker.assign(&dev, Sequence::new(2), 10);

        assert_ne!(c1, c2);
        assert_eq!(c2.as_str(), "laptop-1:2");
    }

    #[test]
    fn devices_chunk_independently() {
        let chunker = OpLogChunker::new(ChunkerConfig::new(2, 1024));
        let laptop = DeviceId::new("laptop-1");
        let phone = DeviceId::new("phone-1");

        let l1 = chunker.assign(&laptop, Sequence::new(1), 10);
        let p1 = chunker.assign(&phone, Sequence::new(1), 10);
        let l2 = chunker.assign(&laptop, Sequence::new(2), 10);

        assert_ne!(l1, p1);
        assert_eq!(l1, l2);
    }

    proptest! {
        #[test]
        fn assignment_is_deterministic(
            sizes in proptest::collection::vec(0usize..200, 1..60),
            max_entries in 1usize..10,
            max_bytes in 1usize..500,
        ) {
            let config = ChunkerConfig::new(max_entries, max_bytes);
            let dev = device();

            let run = |config: ChunkerConfig| -> Vec<ChunkId> {
                let chunker = OpLogChunker::new(config);
                sizes
                    .iter()
                    .enumerate()
                    .map(|(i, &len)| chunker.assign(&dev, Sequence::new(i as u64 + 1), len))
                    .collect()
            };

            prop_assert_eq!(run(config), run(config));
        }

        #[test]
        fn chunks_respect_entry_limit(
            sizes in proptest::collection::vec(0usize..50, 1..100),
            max_entries in 1usize..8,
        ) {
            let chunker = OpLogChunker::new(ChunkerConfig::new(max_entries, usize::MAX));
            let dev = device();

            let mut counts: HashMap<ChunkId, usize> = HashMap::new();
            for (i, &len) in sizes.iter().enumerate() {
                let id = chunker.assign(&dev, Sequence::new(i as u64 + 1), len);
                *counts.entry(id).or_default() += 1;
            }

            for count in counts.values() {
                prop_assert!(*count <= max_entries);
            }
        }
    }
}
