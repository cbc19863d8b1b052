//! Pull/merge/push reconciliation against the remote replica.
//!
//! One reconciler runs per device. A cycle walks a fixed state machine:
//! `Idle → Pulling → Reconciling → Pushing → Idle`, with `Failed`
//! reachable from any non-idle state. Transient transport trouble backs
//! the cycle off and retries; schema mismatches, sequence gaps, and
//! undecryptable records end the epoch and require [`SyncReconciler::resync`].

use crate::bus::MessageBus;
use crate::error::{EngineError, EngineResult};
use crate::remote::RemoteStore;
use crate::snapshot::{CompactionPolicy, SnapshotManager};
use crate::store::{OpLogStore, SnapshotStore};
use crate::EngineConfig;
use opsync_protocol::{
    Command, CorrelationId, DeviceId, Event, EventKind, OpLogDto, Query, QueryResponse, Sequence,
    SyncFailureDto,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Phase of the reconciliation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle in flight.
    Idle,
    /// Fetching the remote snapshot floor and op-log entries.
    Pulling,
    /// Validating and merging pulled entries into the local journal.
    Reconciling,
    /// Sending unacknowledged local entries and snapshots to the remote.
    Pushing,
    /// The epoch ended; only `resync` clears this state.
    Failed,
}

impl SyncState {
    fn as_str(self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Pulling => "pulling",
            SyncState::Reconciling => "reconciling",
            SyncState::Pushing => "pushing",
            SyncState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleReport {
    /// Remote entries merged into the local journal.
    pub pulled: usize,
    /// Local entries acknowledged by the remote.
    pub pushed: usize,
    /// Pulled entries discarded because they were already stored.
    pub duplicates: usize,
    /// Whether a newer remote snapshot was adopted.
    pub snapshot_pulled: bool,
    /// Whether a newer local snapshot was sent to the remote.
    pub snapshot_pushed: bool,
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
}

/// Aggregate counters across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Cycles that ran to completion.
    pub cycles: u64,
    /// Cycles that ended in an error.
    pub failures: u64,
    /// Total entries pulled.
    pub entries_pulled: u64,
    /// Total entries pushed.
    pub entries_pushed: u64,
    /// Total duplicates discarded.
    pub duplicates_discarded: u64,
}

impl SyncStats {
    fn record(&mut self, report: &SyncCycleReport) {
        self.cycles += 1;
        self.entries_pulled += report.pulled as u64;
        self.entries_pushed += report.pushed as u64;
        self.duplicates_discarded += report.duplicates as u64;
    }
}

/// Reconciles the local journal with a remote replica.
pub struct SyncReconciler {
    config: EngineConfig,
    oplog: Arc<dyn OpLogStore>,
    snapshots: Arc<dyn SnapshotStore>,
    manager: SnapshotManager,
    remote: Arc<dyn RemoteStore>,
    bus: Arc<MessageBus>,
    state: Mutex<SyncState>,
    cancelled: AtomicBool,
    stats: Mutex<SyncStats>,
    last_failed_phase: Mutex<SyncState>,
}

impl SyncReconciler {
    /// Creates a reconciler for the configured device.
    pub fn new(
        config: EngineConfig,
        oplog: Arc<dyn OpLogStore>,
        snapshots: Arc<dyn SnapshotStore>,
        manager: SnapshotManager,
        remote: Arc<dyn RemoteStore>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            config,
            oplog,
            snapshots,
            manager,
            remote,
            bus,
            state: Mutex::new(SyncState::Idle),
            cancelled: AtomicBool::new(false),
            stats: Mutex::new(SyncStats::default()),
            last_failed_phase: Mutex::new(SyncState::Idle),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Returns a copy of the aggregate counters.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Requests cancellation of the in-flight cycle.
    ///
    /// The flag is checked between state transitions and between batches,
    /// so a cancelled cycle stops at the next boundary with the journal
    /// consistent and no partial snapshot written.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Runs one full pull/reconcile/push cycle.
    ///
    /// Transient errors leave the reconciler `Idle` so the caller can
    /// retry; epoch-fatal errors move it to `Failed` and publish a
    /// `syncFailed` event.
    pub fn sync(&self) -> EngineResult<SyncCycleReport> {
        self.run_cycle(false)
    }

    /// Runs cycles with exponential backoff until one succeeds.
    ///
    /// Only transport-transient errors and timeouts are retried. When the
    /// retry budget is exhausted the reconciler enters `Failed`.
    pub fn sync_with_retry(&self) -> EngineResult<SyncCycleReport> {
        let retry = self.config.retry.clone();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.run_cycle(false) {
                Ok(report) => return Ok(report),
                Err(error) if error.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    tracing::debug!(
                        device = %self.config.device_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient sync failure, backing off"
                    );
                    std::thread::sleep(delay);
                }
                Err(error) => {
                    if error.is_retryable() {
                        // Budget exhausted on a transient error.
                        let phase = *self.last_failed_phase.lock();
                        self.enter_failed(phase.as_str(), &error);
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Clears `Failed` and re-pulls from a fresh remote snapshot.
    pub fn resync(&self) -> EngineResult<SyncCycleReport> {
        {
            let mut state = self.state.lock();
            if *state != SyncState::Failed {
                return Err(EngineError::invalid_operation(
                    "resync is only valid from the failed state",
                ));
            }
            *state = SyncState::Idle;
        }
        self.run_cycle(true)
    }

    /// Folds journal entries into a new snapshot when `policy` says so.
    ///
    /// The snapshot is stored through the bus, so subscribers observe
    /// `snapshotCreated`, and covered entries are pruned from the journal.
    /// Local entries the remote has not acknowledged yet are kept. Returns
    /// true if a compaction ran. An epoch-fatal failure, such as an entry
    /// that does not decrypt, moves the reconciler to `Failed` just as it
    /// would mid-cycle.
    pub fn compact_if_due(&self, policy: &dyn CompactionPolicy) -> EngineResult<bool> {
        match self.try_compact(policy) {
            Ok(ran) => Ok(ran),
            Err(error) => {
                if error.is_epoch_fatal() {
                    self.enter_failed("compacting", &error);
                }
                Err(error)
            }
        }
    }

    fn try_compact(&self, policy: &dyn CompactionPolicy) -> EngineResult<bool> {
        let schema = &self.config.schema_version;
        let base = self.snapshots.latest(schema)?;
        let floor = base
            .as_ref()
            .and_then(|s| s.sequence)
            .unwrap_or_default();

        let pending = self
            .oplog
            .entries_after(schema, floor, usize::MAX)?;
        let since_last = base
            .as_ref()
            .and_then(|s| s.created_at)
            .map(elapsed_since_millis);
        if !policy.should_compact(pending.len(), since_last) {
            return Ok(false);
        }

        let snapshot = self.manager.compact(base.as_ref(), &pending)?;
        let covered = snapshot.sequence.unwrap_or_default();

        let command = Command::create_snapshot(snapshot).with_correlation_id(CorrelationId::generate());
        let outcome = self.bus.dispatch(&command)?;
        if let Some(event) = outcome.event() {
            self.bus.publish(event);
        }

        self.prune_covered(&pending, covered)?;
        Ok(true)
    }

    fn prune_covered(&self, folded: &[OpLogDto], covered: Sequence) -> EngineResult<()> {
        let schema = &self.config.schema_version;
        let mut devices: Vec<&DeviceId> = folded.iter().map(|e| &e.device_id).collect();
        devices.sort_unstable_by(|a, b| a.as_str().cmp(b.as_str()));
        devices.dedup();

        for device in devices {
            let mut limit = covered;
            if *device == self.config.device_id {
                // Keep entries the remote has not acknowledged yet.
                if let Some(first_unacked) = self
                    .oplog
                    .pending_push(device, schema, 1)?
                    .first()
                    .map(|e| e.sequence)
                {
                    limit = limit.min(Sequence::new(first_unacked.as_u64().saturating_sub(1)));
                }
            }
            let removed = self.oplog.prune_up_to(device, schema, limit)?;
            if removed > 0 {
                tracing::debug!(device = %device, up_to = %limit, removed, "pruned compacted entries");
            }
        }
        Ok(())
    }

    fn run_cycle(&self, refresh_snapshot: bool) -> EngineResult<SyncCycleReport> {
        self.cancelled.store(false, Ordering::Relaxed);
        let started = Instant::now();
        self.transition(SyncState::Idle, SyncState::Pulling)?;

        match self.run_phases(refresh_snapshot) {
            Ok(mut report) => {
                report.duration = started.elapsed();
                *self.state.lock() = SyncState::Idle;
                self.stats.lock().record(&report);
                tracing::info!(
                    device = %self.config.device_id,
                    pulled = report.pulled,
                    pushed = report.pushed,
                    duplicates = report.duplicates,
                    duration_ms = report.duration.as_millis() as u64,
                    "sync cycle complete"
                );
                Ok(report)
            }
            Err(error) => {
                let phase = *self.state.lock();
                *self.last_failed_phase.lock() = phase;
                self.stats.lock().failures += 1;
                if error.is_epoch_fatal() {
                    self.enter_failed(phase.as_str(), &error);
                } else {
                    // Cancelled or transient: the cycle may run again.
                    *self.state.lock() = SyncState::Idle;
                }
                Err(error)
            }
        }
    }

    fn run_phases(&self, refresh_snapshot: bool) -> EngineResult<SyncCycleReport> {
        let mut report = SyncCycleReport::default();

        let (pulled, remote_floor) = self.pull(refresh_snapshot, &mut report)?;

        self.check_cancelled()?;
        self.transition(SyncState::Pulling, SyncState::Reconciling)?;
        self.reconcile(pulled, &mut report)?;

        self.check_cancelled()?;
        self.transition(SyncState::Reconciling, SyncState::Pushing)?;
        self.push(remote_floor, &mut report)?;

        Ok(report)
    }

    /// Pulling: fetch the remote snapshot if it is ahead, then page through
    /// entries above the snapshot floor.
    fn pull(
        &self,
        refresh_snapshot: bool,
        report: &mut SyncCycleReport,
    ) -> EngineResult<(Vec<OpLogDto>, Sequence)> {
        let schema = self.config.schema_version.clone();

        let remote_floor = match self.ask_remote(&Query::get_last_snapshot_sequence(schema.clone()))?
        {
            QueryResponse::LastSnapshotSequence(seq) => seq.unwrap_or_default(),
            other => {
                return Err(EngineError::unexpected_response(format!(
                    "getLastSnapshotSequence answered with {other:?}"
                )))
            }
        };
        let local_floor = self
            .snapshots
            .latest(&schema)?
            .and_then(|s| s.sequence)
            .unwrap_or_default();

        if refresh_snapshot || remote_floor > local_floor {
            match self.ask_remote(&Query::get_latest_snapshot(schema.clone()))? {
                QueryResponse::LatestSnapshot(Some(snapshot)) => {
                    if snapshot.schema_version != schema {
                        return Err(EngineError::SchemaVersionMismatch {
                            expected: schema,
                            found: snapshot.schema_version,
                        });
                    }
                    // The store ignores it when it is not actually newer.
                    self.snapshots.put(snapshot)?;
                    report.snapshot_pulled = true;
                }
                QueryResponse::LatestSnapshot(None) => {}
                other => {
                    return Err(EngineError::unexpected_response(format!(
                        "getLatestSnapshot answered with {other:?}"
                    )))
                }
            }
        }

        let mut after = local_floor.max(remote_floor);
        let mut pulled = Vec::new();
        loop {
            self.check_cancelled()?;
            let page = match self.ask_remote(&Query::get_op_logs(
                schema.clone(),
                after,
                Some(self.config.pull_batch_size),
            ))? {
                QueryResponse::OpLogs(page) => page,
                other => {
                    return Err(EngineError::unexpected_response(format!(
                        "getOpLogs answered with {other:?}"
                    )))
                }
            };
            let Some(last) = page.entries.last() else {
                break;
            };
            if last.sequence <= after {
                // A page that does not advance the cursor would loop forever.
                return Err(EngineError::unexpected_response(format!(
                    "getOpLogs page ended at {} without advancing past {after}",
                    last.sequence
                )));
            }
            after = last.sequence;
            let more = page.has_more;
            pulled.extend(page.entries);
            if !more {
                break;
            }
        }

        Ok((pulled, remote_floor))
    }

    /// Reconciling: validate schema and per-device continuity, then merge
    /// new entries into the journal. Last-writer-wins resolution happens
    /// at compaction over `(sequence, deviceId)`, so merging is append-only
    /// here.
    fn reconcile(&self, pulled: Vec<OpLogDto>, report: &mut SyncCycleReport) -> EngineResult<()> {
        let schema = &self.config.schema_version;

        for entry in &pulled {
            if entry.schema_version != *schema {
                return Err(EngineError::SchemaVersionMismatch {
                    expected: schema.clone(),
                    found: entry.schema_version.clone(),
                });
            }
        }

        let mut by_device: HashMap<&DeviceId, Vec<&OpLogDto>> = HashMap::new();
        for entry in &pulled {
            by_device.entry(&entry.device_id).or_default().push(entry);
        }
        for (device, entries) in &mut by_device {
            entries.sort_unstable_by_key(|e| e.sequence);
            for pair in entries.windows(2) {
                let (a, b) = (pair[0].sequence, pair[1].sequence);
                let expected = a.checked_next().unwrap_or(a);
                if b != a && b != expected {
                    return Err(EngineError::SequenceGap {
                        device: (*device).clone(),
                        expected,
                        found: b,
                    });
                }
            }
        }

        let mut ordered: Vec<&OpLogDto> = by_device.into_values().flatten().collect();
        ordered.sort_unstable_by(|a, b| {
            (a.device_id.as_str(), a.sequence).cmp(&(b.device_id.as_str(), b.sequence))
        });

        for entry in ordered {
            if self
                .oplog
                .contains(&entry.device_id, schema, entry.sequence)?
            {
                report.duplicates += 1;
                continue;
            }
            self.oplog.append(entry.clone())?;
            // Remote-origin entries have nothing to push back.
            self.oplog
                .acknowledge_up_to(&entry.device_id, schema, entry.sequence)?;
            report.pulled += 1;
        }

        Ok(())
    }

    /// Pushing: send unacknowledged local entries, then a newer local
    /// snapshot if the remote is behind on compaction.
    fn push(&self, remote_floor: Sequence, report: &mut SyncCycleReport) -> EngineResult<()> {
        let device = &self.config.device_id;
        let schema = &self.config.schema_version;

        loop {
            self.check_cancelled()?;
            let batch =
                self.oplog
                    .pending_push(device, schema, self.config.push_batch_size as usize)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                let sequence = entry.sequence;
                let correlation = CorrelationId::generate();
                let command = Command::create_op_log(entry).with_correlation_id(correlation);
                let event = self.dispatch_remote(&command)?;
                self.require_ack(&event, EventKind::OpLogCreated, correlation)?;
                self.oplog.acknowledge_up_to(device, schema, sequence)?;
                report.pushed += 1;
            }
        }

        if let Some(snapshot) = self.snapshots.latest(schema)? {
            let covered = snapshot.sequence.unwrap_or_default();
            if covered > remote_floor {
                let correlation = CorrelationId::generate();
                let command = Command::create_snapshot(snapshot).with_correlation_id(correlation);
                let event = self.dispatch_remote(&command)?;
                self.require_ack(&event, EventKind::SnapshotCreated, correlation)?;
                report.snapshot_pushed = true;
            }
        }

        Ok(())
    }

    fn require_ack(
        &self,
        event: &Event,
        expected: EventKind,
        correlation: CorrelationId,
    ) -> EngineResult<()> {
        if event.kind() == expected && event.correlation_id == Some(correlation) {
            Ok(())
        } else {
            Err(EngineError::unexpected_response(format!(
                "expected {expected:?} acknowledging {correlation}, got {:?}",
                event.kind()
            )))
        }
    }

    fn transition(&self, from: SyncState, to: SyncState) -> EngineResult<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(EngineError::InvalidStateTransition {
                from: state.as_str().to_owned(),
                to: to.as_str().to_owned(),
            });
        }
        *state = to;
        Ok(())
    }

    fn check_cancelled(&self) -> EngineResult<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn enter_failed(&self, phase: &str, error: &EngineError) {
        *self.state.lock() = SyncState::Failed;
        tracing::warn!(
            device = %self.config.device_id,
            phase,
            error = %error,
            "sync epoch failed"
        );
        self.bus.publish(&Event::sync_failed(SyncFailureDto {
            device_id: self.config.device_id.clone(),
            schema_version: self.config.schema_version.clone(),
            phase: phase.to_owned(),
            reason: error.to_string(),
        }));
    }

    /// Sends a query to the remote, enforcing the configured round-trip
    /// budget. A blocking transport cannot be interrupted mid-call, so an
    /// overrun is reported as `Timeout` once the call returns.
    fn ask_remote(&self, query: &Query) -> EngineResult<QueryResponse> {
        let started = Instant::now();
        let response = self.remote.ask(query)?;
        self.check_deadline(started)?;
        Ok(response)
    }

    fn dispatch_remote(&self, command: &Command) -> EngineResult<Event> {
        let started = Instant::now();
        let event = self.remote.dispatch(command)?;
        self.check_deadline(started)?;
        Ok(event)
    }

    fn check_deadline(&self, started: Instant) -> EngineResult<()> {
        if started.elapsed() > self.config.timeout {
            Err(EngineError::Timeout)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for SyncReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncReconciler")
            .field("device_id", &self.config.device_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn elapsed_since_millis(created_at: u64) -> Duration {
    let now = opsync_protocol::now_millis();
    Duration::from_millis(now.saturating_sub(created_at))
}
