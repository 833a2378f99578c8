//! In-process message bus: event fan-out and command dispatch.
//!
//! One bus value provides both pub/sub and request/response. Event delivery
//! is synchronous on the publisher's thread unless the subscriber is a queued
//! handler, in which case delivery is an enqueue. Each command type has at
//! most one handler, owned by a dedicated worker thread; dispatch resolves to
//! exactly one [`CommandResponse`] guarded by ack and response timeouts.

use std::any::TypeId;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak, mpsc};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use rill_core::{CommandMessage, CorrelatedMessage, Message, MessageTypeRegistry, SourceStamp};

use crate::command::{CommandAck, CommandError, CommandResponse, FailureKind};
use crate::envelope::CommandEnvelope;

/// Anything that can receive a published message.
///
/// Queued handlers implement this by enqueueing; closure subscriptions run
/// inline on the publisher's thread.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: Arc<dyn Message>);
}

#[derive(Debug, Error)]
pub enum BusError {
    /// A command type may have at most one registered handler.
    #[error("duplicate command handler for {0}")]
    DuplicateCommandHandler(String),
}

/// Dispatch timeouts applied when the caller does not pass explicit ones.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub ack_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(500),
            response_timeout: Duration::from_secs(5),
        }
    }
}

struct EventSub {
    id: u64,
    include_derived: bool,
    sink: Arc<dyn MessageSink>,
}

struct Dispatch {
    command: Arc<dyn CommandMessage>,
    ack_tx: Option<mpsc::Sender<()>>,
    response_tx: Option<mpsc::Sender<CommandResponse>>,
}

struct CommandSlot {
    tx: mpsc::Sender<Dispatch>,
    worker: thread::JoinHandle<()>,
}

struct BusInner {
    name: String,
    registry: Arc<MessageTypeRegistry>,
    config: BusConfig,
    subs: RwLock<HashMap<TypeId, Vec<EventSub>>>,
    any_subs: RwLock<Vec<EventSub>>,
    commands: Mutex<HashMap<TypeId, CommandSlot>>,
    next_sub_id: AtomicU64,
}

/// Cheaply cloneable handle to one bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

/// Cancels one subscription. Dropping the handle does not unsubscribe; call
/// [`SubscriptionHandle::cancel`].
pub struct SubscriptionHandle {
    bus: Weak<BusInner>,
    key: SubKey,
}

enum SubKey {
    Event { type_id: TypeId, id: u64 },
    Any { id: u64 },
    Command { type_id: TypeId },
}

impl SubscriptionHandle {
    pub fn cancel(self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        match self.key {
            SubKey::Event { type_id, id } => {
                let mut subs = inner.subs.write().expect("bus lock poisoned");
                if let Some(list) = subs.get_mut(&type_id) {
                    list.retain(|s| s.id != id);
                }
            }
            SubKey::Any { id } => {
                let mut subs = inner.any_subs.write().expect("bus lock poisoned");
                subs.retain(|s| s.id != id);
            }
            SubKey::Command { type_id } => {
                let slot = inner.commands.lock().expect("bus lock poisoned").remove(&type_id);
                if let Some(slot) = slot {
                    // Disconnect the queue, then let the worker drain out.
                    drop(slot.tx);
                    let _ = slot.worker.join();
                }
            }
        }
    }
}

struct ClosureSink<T, F> {
    handler: F,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T, F> MessageSink for ClosureSink<T, F>
where
    T: Message,
    F: Fn(&T) + Send + Sync,
{
    fn deliver(&self, message: Arc<dyn Message>) {
        if let Some(concrete) = message.as_any().downcast_ref::<T>() {
            (self.handler)(concrete);
        }
    }
}

struct DynClosureSink<F> {
    handler: F,
}

impl<F> MessageSink for DynClosureSink<F>
where
    F: Fn(&dyn Message) + Send + Sync,
{
    fn deliver(&self, message: Arc<dyn Message>) {
        (self.handler)(message.as_ref());
    }
}

impl MessageBus {
    pub fn new(name: impl Into<String>, registry: Arc<MessageTypeRegistry>) -> Self {
        Self::with_config(name, registry, BusConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        registry: Arc<MessageTypeRegistry>,
        config: BusConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                name: name.into(),
                registry,
                config,
                subs: RwLock::new(HashMap::new()),
                any_subs: RwLock::new(Vec::new()),
                commands: Mutex::new(HashMap::new()),
                next_sub_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn registry(&self) -> &Arc<MessageTypeRegistry> {
        &self.inner.registry
    }

    // ─────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────

    /// Subscribe a handler to messages of exactly type `T`.
    pub fn subscribe<T: Message>(
        &self,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.subscribe_sink::<T>(
            Arc::new(ClosureSink { handler, _marker: std::marker::PhantomData }),
            false,
        )
    }

    /// Subscribe a handler to `T` and every registered descendant of `T`.
    ///
    /// Descendants arrive as trait objects since they are distinct Rust
    /// types; downcast per the registry's hierarchy as needed.
    pub fn subscribe_derived<T: Message>(
        &self,
        handler: impl Fn(&dyn Message) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.subscribe_sink::<T>(Arc::new(DynClosureSink { handler }), true)
    }

    /// Subscribe a sink (typically a queued handler) to `T`.
    pub fn subscribe_sink<T: Message>(
        &self,
        sink: Arc<dyn MessageSink>,
        include_derived: bool,
    ) -> SubscriptionHandle {
        let type_id = TypeId::of::<T>();
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subs
            .write()
            .expect("bus lock poisoned")
            .entry(type_id)
            .or_default()
            .push(EventSub { id, include_derived, sink });
        SubscriptionHandle {
            bus: Arc::downgrade(&self.inner),
            key: SubKey::Event { type_id, id },
        }
    }

    /// Subscribe a sink to every message on the bus (bridges, tracing).
    pub fn subscribe_any(&self, sink: Arc<dyn MessageSink>) -> SubscriptionHandle {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .any_subs
            .write()
            .expect("bus lock poisoned")
            .push(EventSub { id, include_derived: true, sink });
        SubscriptionHandle {
            bus: Arc::downgrade(&self.inner),
            key: SubKey::Any { id },
        }
    }

    /// Deliver to every handler whose declared type equals, or is an ancestor
    /// of, the message's runtime type. Ordering across handlers is
    /// unspecified.
    pub fn publish(&self, message: Arc<dyn Message>) {
        publish_on(&self.inner, &message);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────

    /// Register the single handler for command type `C` and spawn its worker.
    ///
    /// Handler errors and handler panics both become a `Fail` response; the
    /// worker keeps running afterwards.
    pub fn subscribe_command<C, H>(&self, handler: H) -> Result<SubscriptionHandle, BusError>
    where
        C: CommandMessage,
        H: Fn(&C) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    {
        let type_id = TypeId::of::<C>();
        let command_type = std::any::type_name::<C>()
            .rsplit("::")
            .next()
            .unwrap_or("command")
            .to_string();

        let mut commands = self.inner.commands.lock().expect("bus lock poisoned");
        if commands.contains_key(&type_id) {
            return Err(BusError::DuplicateCommandHandler(command_type));
        }

        let (tx, rx) = mpsc::channel::<Dispatch>();
        let bus = Arc::downgrade(&self.inner);
        let worker_type = command_type.clone();
        let worker = thread::Builder::new()
            .name(format!("cmd-{command_type}"))
            .spawn(move || command_worker(bus, rx, worker_type, handler))
            .expect("failed to spawn command worker thread");

        commands.insert(type_id, CommandSlot { tx, worker });
        Ok(SubscriptionHandle {
            bus: Arc::downgrade(&self.inner),
            key: SubKey::Command { type_id },
        })
    }

    /// Dispatch and return the response, collapsing failure to an error.
    pub fn send<C: CommandMessage>(&self, command: C) -> Result<CommandResponse, CommandError> {
        let config = self.inner.config.clone();
        self.send_with_timeouts(command, config.ack_timeout, config.response_timeout)
    }

    pub fn send_with_timeouts<C: CommandMessage>(
        &self,
        command: C,
        ack_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<CommandResponse, CommandError> {
        let response = self.try_send_with_timeouts(command, ack_timeout, response_timeout);
        match CommandError::from_response(&response) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    /// Dispatch and return the response without collapsing failures.
    pub fn try_send<C: CommandMessage>(&self, command: C) -> CommandResponse {
        let config = self.inner.config.clone();
        self.try_send_with_timeouts(command, config.ack_timeout, config.response_timeout)
    }

    pub fn try_send_with_timeouts<C: CommandMessage>(
        &self,
        command: C,
        ack_timeout: Duration,
        response_timeout: Duration,
    ) -> CommandResponse {
        self.dispatch(into_dispatchable(command), ack_timeout, response_timeout)
    }

    /// Fire and forget: true iff a handler is registered and the command was
    /// enqueued.
    pub fn try_send_async<C: CommandMessage>(&self, command: C) -> bool {
        self.dispatch_async(into_dispatchable(command))
    }

    /// Dispatch the command carried by an envelope (the envelope stamped the
    /// correlation at construction).
    pub fn send_envelope(&self, envelope: &CommandEnvelope) -> Result<CommandResponse, CommandError> {
        let response = self.try_send_envelope(envelope);
        match CommandError::from_response(&response) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    pub fn try_send_envelope(&self, envelope: &CommandEnvelope) -> CommandResponse {
        let config = self.inner.config.clone();
        self.dispatch(
            Arc::clone(envelope.command()),
            config.ack_timeout,
            config.response_timeout,
        )
    }

    /// Dynamic dispatch used by envelopes and bridges.
    pub fn dispatch(
        &self,
        command: Arc<dyn CommandMessage>,
        ack_timeout: Duration,
        response_timeout: Duration,
    ) -> CommandResponse {
        let command_id = command.msg_id();
        let command_type = command.type_name().to_string();
        let correlation = command.correlation_id();

        let tx = {
            let commands = self.inner.commands.lock().expect("bus lock poisoned");
            commands
                .get(&command.as_any().type_id())
                .map(|slot| slot.tx.clone())
        };
        let Some(tx) = tx else {
            return CommandResponse::fail(
                command_id,
                command_type,
                correlation,
                FailureKind::Unsubscribed,
                "no handler subscribed for command",
            );
        };

        let (ack_tx, ack_rx) = mpsc::channel();
        let (response_tx, response_rx) = mpsc::channel();
        if tx
            .send(Dispatch {
                command,
                ack_tx: Some(ack_tx),
                response_tx: Some(response_tx),
            })
            .is_err()
        {
            return CommandResponse::fail(
                command_id,
                command_type,
                correlation,
                FailureKind::Unsubscribed,
                "command handler worker is gone",
            );
        }

        if ack_rx.recv_timeout(ack_timeout).is_err() {
            return CommandResponse::fail(
                command_id,
                command_type,
                correlation,
                FailureKind::AckTimeout,
                format!("no ack within {ack_timeout:?}"),
            );
        }

        match response_rx.recv_timeout(response_timeout) {
            Ok(response) => response,
            Err(_) => CommandResponse::fail(
                command_id,
                command_type,
                correlation,
                FailureKind::ResponseTimeout,
                format!("no response within {response_timeout:?}"),
            ),
        }
    }

    pub fn dispatch_async(&self, command: Arc<dyn CommandMessage>) -> bool {
        let tx = {
            let commands = self.inner.commands.lock().expect("bus lock poisoned");
            commands
                .get(&command.as_any().type_id())
                .map(|slot| slot.tx.clone())
        };
        match tx {
            Some(tx) => tx
                .send(Dispatch { command, ack_tx: None, response_tx: None })
                .is_ok(),
            None => false,
        }
    }

    /// True iff a handler is registered for the command type.
    pub fn handles(&self, command: &dyn CommandMessage) -> bool {
        self.inner
            .commands
            .lock()
            .expect("bus lock poisoned")
            .contains_key(&command.as_any().type_id())
    }
}

impl core::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageBus").field("name", &self.inner.name).finish()
    }
}

/// Stamp a fresh causal chain onto an unstamped command, then erase the type.
fn into_dispatchable<C: CommandMessage>(mut command: C) -> Arc<dyn CommandMessage> {
    if command.correlation_id().is_none() {
        let stamp = SourceStamp::root(command.msg_id());
        command.stamp(stamp.correlation_id, stamp.msg_id.into());
    }
    Arc::new(command)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        format!("command handler panicked: {text}")
    } else if let Some(text) = panic.downcast_ref::<String>() {
        format!("command handler panicked: {text}")
    } else {
        "command handler panicked".to_string()
    }
}

fn publish_on(inner: &Arc<BusInner>, message: &Arc<dyn Message>) {
    let runtime_type = message.as_any().type_id();
    let ancestors = inner.registry.ancestors_and_self(runtime_type);

    // Collect sinks first so handlers can subscribe/publish reentrantly.
    let mut sinks: Vec<Arc<dyn MessageSink>> = Vec::new();
    {
        let subs = inner.subs.read().expect("bus lock poisoned");
        for (depth, ancestor) in ancestors.iter().enumerate() {
            if let Some(list) = subs.get(ancestor) {
                for sub in list {
                    if depth == 0 || sub.include_derived {
                        sinks.push(Arc::clone(&sub.sink));
                    }
                }
            }
        }
    }
    {
        let any_subs = inner.any_subs.read().expect("bus lock poisoned");
        for sub in any_subs.iter() {
            sinks.push(Arc::clone(&sub.sink));
        }
    }

    for sink in sinks {
        sink.deliver(Arc::clone(message));
    }
}

fn command_worker<C, H>(
    bus: Weak<BusInner>,
    rx: mpsc::Receiver<Dispatch>,
    command_type: String,
    handler: H,
) where
    C: CommandMessage,
    H: Fn(&C) -> Result<(), Box<dyn std::error::Error + Send + Sync>>,
{
    while let Ok(dispatch) = rx.recv() {
        let command_id = dispatch.command.msg_id();
        let correlation = dispatch.command.correlation_id();

        // Ack as soon as dispatch is accepted, before the handler runs.
        if let Some(inner) = bus.upgrade() {
            let ack: Arc<dyn Message> = Arc::new(CommandAck {
                id: rill_core::MsgId::new(),
                command_id,
                command_type: command_type.clone(),
                correlation_id: correlation,
                causation_id: Some(command_id.into()),
            });
            publish_on(&inner, &ack);
        }
        if let Some(ack_tx) = &dispatch.ack_tx {
            let _ = ack_tx.send(());
        }

        // A handler that returns an error or panics produces the same Fail;
        // the worker survives either way, so the command type stays handled.
        let result = catch_unwind(AssertUnwindSafe(|| {
            match dispatch.command.as_any().downcast_ref::<C>() {
                Some(command) => handler(command),
                None => Err("command type mismatch at dispatch".into()),
            }
        }))
        .unwrap_or_else(|panic| Err(panic_message(panic.as_ref()).into()));

        let response = match result {
            Ok(()) => CommandResponse::success(command_id, command_type.clone(), correlation),
            Err(err) => {
                debug!(command = %command_type, error = %err, "command handler failed");
                CommandResponse::fail(
                    command_id,
                    command_type.clone(),
                    correlation,
                    FailureKind::Handler,
                    err.to_string(),
                )
            }
        };

        if let Some(inner) = bus.upgrade() {
            let published: Arc<dyn Message> = Arc::new(response.clone());
            publish_on(&inner, &published);
        }
        if let Some(response_tx) = &dispatch.response_tx {
            let _ = response_tx.send(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queued_handler::QueuedHandler;
    use rill_core::{CausationId, CorrelationId, MsgId};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ThingHappened {
        id: MsgId,
    }
    rill_core::impl_message!(ThingHappened);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SpecificThingHappened {
        id: MsgId,
    }
    rill_core::impl_message!(SpecificThingHappened);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct StartThing {
        id: MsgId,
        fail: bool,
        correlation_id: Option<CorrelationId>,
        causation_id: Option<CausationId>,
    }
    rill_core::impl_command_message!(StartThing);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SlowThing {
        id: MsgId,
        correlation_id: Option<CorrelationId>,
        causation_id: Option<CausationId>,
    }
    rill_core::impl_command_message!(SlowThing);

    fn registry() -> Arc<MessageTypeRegistry> {
        let registry = MessageTypeRegistry::new();
        registry.register::<ThingHappened>().unwrap();
        registry
            .register_as::<SpecificThingHappened, ThingHappened>()
            .unwrap();
        registry.register::<StartThing>().unwrap();
        registry.register::<SlowThing>().unwrap();
        Arc::new(registry)
    }

    fn bus() -> MessageBus {
        MessageBus::with_config(
            "test-bus",
            registry(),
            BusConfig {
                ack_timeout: Duration::from_millis(500),
                response_timeout: Duration::from_secs(2),
            },
        )
    }

    fn start_thing(fail: bool) -> StartThing {
        StartThing {
            id: MsgId::new(),
            fail,
            correlation_id: None,
            causation_id: None,
        }
    }

    #[test]
    fn publish_reaches_every_exact_subscriber() {
        let bus = bus();
        let count = Arc::new(AtomicU32::new(0));

        let c1 = Arc::clone(&count);
        let _s1 = bus.subscribe::<ThingHappened>(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        let _s2 = bus.subscribe::<ThingHappened>(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Arc::new(ThingHappened { id: MsgId::new() }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn derived_subscription_sees_descendants_exact_does_not() {
        let bus = bus();
        let derived_hits = Arc::new(AtomicU32::new(0));
        let exact_hits = Arc::new(AtomicU32::new(0));

        let d = Arc::clone(&derived_hits);
        let _s1 = bus.subscribe_derived::<ThingHappened>(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let e = Arc::clone(&exact_hits);
        let _s2 = bus.subscribe::<ThingHappened>(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Arc::new(SpecificThingHappened { id: MsgId::new() }));
        assert_eq!(derived_hits.load(Ordering::SeqCst), 1);
        assert_eq!(exact_hits.load(Ordering::SeqCst), 0);

        bus.publish(Arc::new(ThingHappened { id: MsgId::new() }));
        assert_eq!(derived_hits.load(Ordering::SeqCst), 2);
        assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_subscription_stops_receiving() {
        let bus = bus();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let sub = bus.subscribe::<ThingHappened>(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Arc::new(ThingHappened { id: MsgId::new() }));
        sub.cancel();
        bus.publish(Arc::new(ThingHappened { id: MsgId::new() }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_sink_receives_as_enqueue() {
        let bus = bus();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let queue = Arc::new(QueuedHandler::new("test-sink", move |_m| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok::<(), ()>(())
        }));
        queue.start();
        let _sub = bus.subscribe_sink::<ThingHappened>(Arc::clone(&queue) as Arc<dyn MessageSink>, false);

        bus.publish(Arc::new(ThingHappened { id: MsgId::new() }));

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        queue.stop();
    }

    #[test]
    fn command_success_roundtrip_publishes_ack_and_response() {
        let bus = bus();
        let acks = Arc::new(AtomicU32::new(0));
        let responses = Arc::new(AtomicU32::new(0));

        let a = Arc::clone(&acks);
        let _s1 = bus.subscribe::<CommandAck>(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let r = Arc::clone(&responses);
        let _s2 = bus.subscribe::<CommandResponse>(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let _handler = bus
            .subscribe_command::<StartThing, _>(|cmd| {
                if cmd.fail { Err("rejected".into()) } else { Ok(()) }
            })
            .unwrap();

        let response = bus.send(start_thing(false)).unwrap();
        assert!(response.is_success());
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(responses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_error_is_wrapped_into_fail() {
        let bus = bus();
        let _handler = bus
            .subscribe_command::<StartThing, _>(|cmd| {
                if cmd.fail { Err("rejected".into()) } else { Ok(()) }
            })
            .unwrap();

        let response = bus.try_send(start_thing(true));
        let (kind, error) = response.failure().unwrap();
        assert_eq!(kind, FailureKind::Handler);
        assert!(error.contains("rejected"));

        let err = bus.send(start_thing(true)).unwrap_err();
        assert_eq!(err.kind, FailureKind::Handler);
    }

    #[test]
    fn panicking_handler_is_wrapped_and_the_worker_survives() {
        let bus = bus();
        let _handler = bus
            .subscribe_command::<StartThing, _>(|cmd| {
                if cmd.fail {
                    panic!("handler exploded");
                }
                Ok(())
            })
            .unwrap();

        let response = bus.try_send(start_thing(true));
        let (kind, error) = response.failure().unwrap();
        assert_eq!(kind, FailureKind::Handler);
        assert!(error.contains("exploded"));

        // The same worker still handles the next dispatch.
        let response = bus.try_send(start_thing(false));
        assert!(response.is_success());
    }

    #[test]
    fn duplicate_command_handler_is_rejected() {
        let bus = bus();
        let _first = bus.subscribe_command::<StartThing, _>(|_| Ok(())).unwrap();
        let second = bus.subscribe_command::<StartThing, _>(|_| Ok(()));
        assert!(matches!(second, Err(BusError::DuplicateCommandHandler(_))));
    }

    #[test]
    fn unsubscribed_command_fails_immediately() {
        let bus = bus();
        let start = Instant::now();
        let response = bus.try_send(start_thing(false));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(response.failure().unwrap().0, FailureKind::Unsubscribed);
    }

    #[test]
    fn slow_handler_times_out_with_response_timeout() {
        let bus = bus();
        let _handler = bus
            .subscribe_command::<SlowThing, _>(|_| {
                thread::sleep(Duration::from_millis(600));
                Ok(())
            })
            .unwrap();

        let start = Instant::now();
        let response = bus.try_send_with_timeouts(
            SlowThing { id: MsgId::new(), correlation_id: None, causation_id: None },
            Duration::from_millis(300),
            Duration::from_millis(150),
        );
        let elapsed = start.elapsed();

        // Acked promptly, then timed out waiting for completion.
        assert_eq!(response.failure().unwrap().0, FailureKind::ResponseTimeout);
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[test]
    fn try_send_async_reports_handler_registration() {
        let bus = bus();
        assert!(!bus.try_send_async(start_thing(false)));

        let handled = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&handled);
        let _handler = bus
            .subscribe_command::<StartThing, _>(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(bus.try_send_async(start_thing(false)));
        let deadline = Instant::now() + Duration::from_secs(2);
        while handled.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn commands_on_one_worker_handle_in_enqueue_order() {
        let bus = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _handler = bus
            .subscribe_command::<StartThing, _>(move |cmd| {
                s.lock().unwrap().push(cmd.msg_id());
                Ok(())
            })
            .unwrap();

        let ids: Vec<MsgId> = (0..10)
            .map(|_| {
                let cmd = start_thing(false);
                let id = cmd.id;
                assert!(bus.try_send_async(cmd));
                id
            })
            .collect();

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().len() < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock().unwrap(), ids);
    }

    #[test]
    fn envelopes_dispatch_their_carried_command() {
        use crate::envelope::Principal;

        let bus = bus();
        let handled = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&handled);
        let _handler = bus
            .subscribe_command::<StartThing, _>(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let envelope = CommandEnvelope::new(start_thing(false), Principal::system());
        let response = bus.send_envelope(&envelope).unwrap();

        assert!(response.is_success());
        assert_eq!(response.command_id(), envelope.command_id());
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_stamps_a_root_correlation() {
        let bus = bus();
        let observed = Arc::new(Mutex::new(None));
        let o = Arc::clone(&observed);
        let _handler = bus
            .subscribe_command::<StartThing, _>(move |cmd| {
                *o.lock().unwrap() = Some((cmd.correlation_id, cmd.causation_id));
                Ok(())
            })
            .unwrap();

        bus.send(start_thing(false)).unwrap();
        let (correlation, causation) = observed.lock().unwrap().take().unwrap();
        assert!(correlation.is_some());
        assert!(causation.is_some());
    }
}
