//! Per-device sequence allocation.

use crate::error::{EngineError, EngineResult};
use opsync_protocol::{DeviceId, SchemaVersion, Sequence};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

type CounterKey = (DeviceId, SchemaVersion);

/// Issues monotonically increasing, gap-free sequence numbers.
///
/// Allocation is serialized per `(deviceId, schemaVersion)` key with a
/// per-key mutex; callers on different keys never contend. Counter
/// exhaustion is surfaced as [`EngineError::AllocatorOverflow`], never
/// silently wrapped.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    counters: RwLock<HashMap<CounterKey, Arc<Mutex<u64>>>>,
}

impl SequenceAllocator {
    /// Creates an allocator with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, device: &DeviceId, schema: &SchemaVersion) -> Arc<Mutex<u64>> {
        if let Some(counter) = self.counters.read().get(&(device.clone(), schema.clone())) {
            return Arc::clone(counter);
        }

        let mut counters = self.counters.write();
        Arc::clone(
            counters
                .entry((device.clone(), schema.clone()))
                .or_insert_with(|| Arc::new(Mutex::new(0))),
        )
    }

    /// Issues the next sequence for the given device and schema version.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AllocatorOverflow`] when the counter is
    /// exhausted.
    pub fn next(&self, device: &DeviceId, schema: &SchemaVersion) -> EngineResult<Sequence> {
        let counter = self.counter(device, schema);
        let mut current = counter.lock();

        let next = current
            .checked_add(1)
            .ok_or_else(|| EngineError::AllocatorOverflow {
                device: device.clone(),
                schema: schema.clone(),
            })?;

        *current = next;
        Ok(Sequence::new(next))
    }

    /// Seeds a counter from persisted state.
    ///
    /// The next allocation for this key returns `last.checked_next()`.
    /// Seeding never moves a counter backwards.
    pub fn seed(&self, device: &DeviceId, schema: &SchemaVersion, last: Sequence) {
        let counter = self.counter(device, schema);
        let mut current = counter.lock();
        *current = (*current).max(last.as_u64());
    }

    /// Returns the last issued sequence for a key, if any.
    #[must_use]
    pub fn last_issued(&self, device: &DeviceId, schema: &SchemaVersion) -> Option<Sequence> {
        let counters = self.counters.read();
        counters
            .get(&(device.clone(), schema.clone()))
            .map(|c| *c.lock())
            .filter(|&v| v > 0)
            .map(Sequence::new)
    }
}
