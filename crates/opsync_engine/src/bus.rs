//! Command/Event/Query routing.

use crate::error::{EngineError, EngineResult};
use opsync_protocol::{
    Command, CommandKind, CorrelationId, Event, Query, QueryKind, QueryResponse,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Result of dispatching a command.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The handler produced an event.
    Event(Event),
    /// The handler completed without producing an event.
    Ack,
}

impl DispatchOutcome {
    /// Returns the produced event, if any.
    #[must_use]
    pub fn event(&self) -> Option<&Event> {
        match self {
            DispatchOutcome::Event(event) => Some(event),
            DispatchOutcome::Ack => None,
        }
    }
}

/// Handles commands of a registered kind.
pub trait CommandHandler: Send + Sync {
    /// Executes the command and returns its outcome.
    fn handle(&self, command: &Command) -> EngineResult<DispatchOutcome>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Command) -> EngineResult<DispatchOutcome> + Send + Sync,
{
    fn handle(&self, command: &Command) -> EngineResult<DispatchOutcome> {
        self(command)
    }
}

/// Handles queries of a registered kind.
pub trait QueryHandler: Send + Sync {
    /// Executes the read-only query.
    fn handle(&self, query: &Query) -> EngineResult<QueryResponse>;
}

impl<F> QueryHandler for F
where
    F: Fn(&Query) -> EngineResult<QueryResponse> + Send + Sync,
{
    fn handle(&self, query: &Query) -> EngineResult<QueryResponse> {
        self(query)
    }
}

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

/// Bounded cache of command outcomes keyed by correlation ID.
///
/// A duplicate is not an error: the cached outcome is replayed without
/// re-executing the handler. Retention is capacity-bounded FIFO.
#[derive(Default)]
struct ReplayCache {
    outcomes: HashMap<CorrelationId, DispatchOutcome>,
    order: VecDeque<CorrelationId>,
    capacity: usize,
}

impl ReplayCache {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, id: &CorrelationId) -> Option<DispatchOutcome> {
        self.outcomes.get(id).cloned()
    }

    fn insert(&mut self, id: CorrelationId, outcome: DispatchOutcome) {
        if self.capacity == 0 {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.outcomes.remove(&evicted);
            }
        }
        if self.outcomes.insert(id, outcome).is_none() {
            self.order.push_back(id);
        }
    }
}

/// Routes Command, Query and Event messages between the local writer,
/// the reconciler and external collaborators.
///
/// Handlers are registered per discriminator. Commands from the same
/// origin are processed in submission order (dispatch serializes handler
/// execution); events go at-least-once to every subscriber.
pub struct MessageBus {
    command_handlers: RwLock<HashMap<CommandKind, Arc<dyn CommandHandler>>>,
    query_handlers: RwLock<HashMap<QueryKind, Arc<dyn QueryHandler>>>,
    subscribers: RwLock<Vec<Subscriber>>,
    replay: Mutex<ReplayCache>,
    dispatch_serial: Mutex<()>,
}

impl MessageBus {
    /// Creates a bus with the given replay-cache capacity.
    #[must_use]
    pub fn new(dedup_capacity: usize) -> Self {
        Self {
            command_handlers: RwLock::new(HashMap::new()),
            query_handlers: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            replay: Mutex::new(ReplayCache::new(dedup_capacity)),
            dispatch_serial: Mutex::new(()),
        }
    }

    /// Registers the handler for a command kind, replacing any previous one.
    pub fn register_command_handler(&self, kind: CommandKind, handler: Arc<dyn CommandHandler>) {
        self.command_handlers.write().insert(kind, handler);
    }

    /// Registers the handler for a query kind, replacing any previous one.
    pub fn register_query_handler(&self, kind: QueryKind, handler: Arc<dyn QueryHandler>) {
        self.query_handlers.write().insert(kind, handler);
    }

    /// Registers an event subscriber.
    pub fn subscribe(&self, subscriber: impl Fn(&Event) + Send + Sync + 'static) {
        self.subscribers.write().push(Box::new(subscriber));
    }

    /// Dispatches a command to its registered handler.
    ///
    /// A command whose `correlationId` is already in the retention window
    /// short-circuits to the previously produced outcome.
    pub fn dispatch(&self, command: &Command) -> EngineResult<DispatchOutcome> {
        let _serial = self.dispatch_serial.lock();

        if let Some(id) = command.correlation_id {
            if let Some(cached) = self.replay.lock().get(&id) {
                tracing::debug!(correlation_id = %id, "duplicate command, replaying cached outcome");
                return Ok(cached);
            }
        }

        let handler = self
            .command_handlers
            .read()
            .get(&command.kind())
            .cloned()
            .ok_or_else(|| EngineError::NoHandler {
                kind: command.kind().as_str().to_string(),
            })?;

        let outcome = handler.handle(command)?;

        if let Some(id) = command.correlation_id {
            self.replay.lock().insert(id, outcome.clone());
        }

        Ok(outcome)
    }

    /// Issues a read-only query to its registered handler.
    pub fn ask(&self, query: &Query) -> EngineResult<QueryResponse> {
        let handler = self
            .query_handlers
            .read()
            .get(&query.kind())
            .cloned()
            .ok_or_else(|| EngineError::NoHandler {
                kind: query.kind().as_str().to_string(),
            })?;

        handler.handle(query)
    }

    /// Publishes an event to every subscriber, fire-and-forget.
    pub fn publish(&self, event: &Event) {
        for subscriber in self.subscribers.read().iter() {
            subscriber(event);
        }
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("command_handlers", &self.command_handlers.read().len())
            .field("query_handlers", &self.query_handlers.read().len())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsync_protocol::{
        ChunkId, DeviceId, OpLogDto, SchemaVersion, Sequence,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_entry(seq: u64) -> OpLogDto {
        let device = DeviceId::new("laptop-1");
        OpLogDto::new(
            device.clone(),
            ChunkId::derive(&device, Sequence::new(seq)),
            SchemaVersion::new("v1"),
            Sequence::new(seq),
            vec![0u8; 12],
            vec![1],
            vec!["k".into()],
        )
    }

    #[test]
    fn dispatch_routes_to_handler() {
        let bus = MessageBus::new(16);
        bus.register_command_handler(
            CommandKind::CreateOpLog,
            Arc::new(|cmd: &Command| {
                let event = match &cmd.payload {
                    opsync_protocol::CommandPayload::CreateOpLog(entry) => {
                        Event::op_log_created(entry.clone(), cmd.correlation_id)
                    }
                    other => panic!("unexpected payload: {other:?}"),
                };
                Ok(DispatchOutcome::Event(event))
            }),
        );

        let command = Command::create_op_log(sample_entry(1));
        let outcome = bus.dispatch(&command).unwrap();
        assert!(outcome.event().is_some());
    }

    #[test]
    fn dispatch_without_handler_fails() {
        let bus = MessageBus::new(16);
        let command = Command::create_op_log(sample_entry(1));
        let err = bus.dispatch(&command).unwrap_err();
        assert!(matches!(err, EngineError::NoHandler { .. }));
    }

    #[test]
    fn duplicate_correlation_id_executes_once() {
        let bus = MessageBus::new(16);
        let executions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executions);

        bus.register_command_handler(
            CommandKind::CreateOpLog,
            Arc::new(move |_: &Command| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(DispatchOutcome::Ack)
            }),
        );

        let command =
            Command::create_op_log(sample_entry(1)).with_correlation_id(CorrelationId::generate());

        bus.dispatch(&command).unwrap();
        bus.dispatch(&command).unwrap();
        bus.dispatch(&command).unwrap();

        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn commands_without_correlation_id_always_execute() {
        let bus = MessageBus::new(16);
        let executions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executions);

        bus.register_command_handler(
            CommandKind::CreateOpLog,
            Arc::new(move |_: &Command| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(DispatchOutcome::Ack)
            }),
        );

        bus.dispatch(&Command::create_op_log(sample_entry(1))).unwrap();
        bus.dispatch(&Command::create_op_log(sample_entry(2))).unwrap();

        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn replay_cache_eviction_is_bounded() {
        let bus = MessageBus::new(2);
        let executions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executions);

        bus.register_command_handler(
            CommandKind::CreateOpLog,
            Arc::new(move |_: &Command| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(DispatchOutcome::Ack)
            }),
        );

        let first =
            Command::create_op_log(sample_entry(1)).with_correlation_id(CorrelationId::generate());
        bus.dispatch(&first).unwrap();

        // Push two more correlation IDs through a capacity-2 cache,
        // evicting the first.
        for seq in 2..=3 {
            let cmd = Command::create_op_log(sample_entry(seq))
                .with_correlation_id(CorrelationId::generate());
            bus.dispatch(&cmd).unwrap();
        }

        bus.dispatch(&first).unwrap();
        assert_eq!(executions.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn failed_commands_are_not_cached() {
        let bus = MessageBus::new(16);
        let executions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executions);

        bus.register_command_handler(
            CommandKind::CreateOpLog,
            Arc::new(move |_: &Command| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(EngineError::transport_retryable("flaky"))
                } else {
                    Ok(DispatchOutcome::Ack)
                }
            }),
        );

        let command =
            Command::create_op_log(sample_entry(1)).with_correlation_id(CorrelationId::generate());

        assert!(bus.dispatch(&command).is_err());
        // Retry with the same correlation ID re-executes and succeeds.
        assert!(bus.dispatch(&command).is_ok());
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn publish_reaches_all_subscribers() {
        let bus = MessageBus::new(16);
        let received = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&received);
            bus.subscribe(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish(&Event::op_log_created(sample_entry(1), None));
        assert_eq!(received.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn ask_routes_query() {
        let bus = MessageBus::new(16);
        bus.register_query_handler(
            QueryKind::GetLastSnapshotSequence,
            Arc::new(|_: &Query| Ok(QueryResponse::LastSnapshotSequence(Some(Sequence::new(7))))),
        );

        let response = bus
            .ask(&Query::get_last_snapshot_sequence(SchemaVersion::new("v1")))
            .unwrap();
        assert_eq!(
            response,
            QueryResponse::LastSnapshotSequence(Some(Sequence::new(7)))
        );
    }

    #[test]
    fn ask_without_handler_fails() {
        let bus = MessageBus::new(16);
        let err = bus
            .ask(&Query::get_latest_snapshot(SchemaVersion::new("v1")))
            .unwrap_err();
        assert!(matches!(err, EngineError::NoHandler { .. }));
    }
}
