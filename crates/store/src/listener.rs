//! Read-model listener: gap-free event history, then live events.
//!
//! `start` reads the stream forward from the checkpoint, publishing every
//! decoded event onto an internal bus through a queued handler, then opens a
//! catch-up subscription from the recorded end position. The store's
//! event-number dedup across that handoff is what guarantees every handler
//! sees each event exactly once, in non-decreasing stream order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use rill_bus::{MessageBus, MessageSink, QueuedHandler, SubscriptionHandle};
use rill_core::{AggregateKind, CancelToken, Message, MessageTypeRegistry, RegistryError};

use crate::naming::StreamNameBuilder;
use crate::repository::decode_recorded;
use crate::store::{
    ReadState, StoreError, StoreSubscription, StreamName, StreamStore, SubscriptionDropReason,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPhase {
    Starting,
    CatchingUp,
    Live,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener already started")]
    AlreadyStarted,

    #[error("listened stream {0} has been deleted")]
    StreamDeleted(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct PhaseCell {
    phase: Mutex<ListenerPhase>,
    changed: Condvar,
}

impl PhaseCell {
    fn set(&self, phase: ListenerPhase) {
        *self.phase.lock().expect("listener lock poisoned") = phase;
        self.changed.notify_all();
    }

    fn get(&self) -> ListenerPhase {
        *self.phase.lock().expect("listener lock poisoned")
    }

    /// Block until the live transition, aborting early when `should_abort`
    /// reports the listener unhealthy.
    fn wait_for_live(&self, should_abort: impl Fn() -> bool) {
        let mut guard = self.phase.lock().expect("listener lock poisoned");
        while *guard != ListenerPhase::Live {
            if should_abort() {
                return;
            }
            let (g, _) = self
                .changed
                .wait_timeout(guard, Duration::from_millis(250))
                .expect("listener lock poisoned");
            guard = g;
        }
    }
}

/// Tails one stream (usually a category) into an internal event bus that
/// projections subscribe to.
pub struct StreamListener {
    name: String,
    store: Arc<dyn StreamStore>,
    namer: StreamNameBuilder,
    registry: Arc<MessageTypeRegistry>,
    event_stream: MessageBus,
    queue: Arc<QueuedHandler>,
    phase: Arc<PhaseCell>,
    decode_failures: Arc<AtomicU32>,
    subscription: Mutex<Option<StoreSubscription>>,
}

impl StreamListener {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn StreamStore>,
        namer: StreamNameBuilder,
        registry: Arc<MessageTypeRegistry>,
    ) -> Self {
        let name = name.into();
        let event_stream = MessageBus::new(format!("{name}-events"), Arc::clone(&registry));
        let publisher = event_stream.clone();
        let queue = Arc::new(QueuedHandler::new(format!("{name}-queue"), move |message| {
            publisher.publish(message);
            Ok::<(), StoreError>(())
        }));
        queue.start();
        Self {
            name,
            store,
            namer,
            registry,
            event_stream,
            queue,
            phase: Arc::new(PhaseCell {
                phase: Mutex::new(ListenerPhase::Starting),
                changed: Condvar::new(),
            }),
            decode_failures: Arc::new(AtomicU32::new(0)),
            subscription: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bus projections subscribe their handlers to.
    pub fn event_stream(&self) -> &MessageBus {
        &self.event_stream
    }

    /// Start on the category stream of aggregate kind `A`.
    pub fn start_category<A: AggregateKind>(
        &self,
        checkpoint: Option<i64>,
        block_until_live: bool,
    ) -> Result<(), ListenerError> {
        let stream = self.namer.category_for(A::KIND);
        self.start(&stream, checkpoint, block_until_live)
    }

    /// Catch up from `checkpoint` (exclusive; `None` = the beginning), then
    /// stay subscribed for live events.
    pub fn start(
        &self,
        stream: &StreamName,
        checkpoint: Option<i64>,
        block_until_live: bool,
    ) -> Result<(), ListenerError> {
        {
            let guard = self.subscription.lock().expect("listener lock poisoned");
            if guard.is_some() {
                return Err(ListenerError::AlreadyStarted);
            }
        }
        self.phase.set(ListenerPhase::CatchingUp);

        // Stage one: sequential reader up to the current end.
        let cancel = CancelToken::new();
        let mut position = checkpoint;
        let mut from = checkpoint.map(|c| c + 1).unwrap_or(0);
        loop {
            let slice = self.store.read_forward(stream, from, 256, &cancel)?;
            match slice.state {
                ReadState::Deleted => {
                    return Err(ListenerError::StreamDeleted(stream.as_str().to_string()));
                }
                ReadState::NotFound | ReadState::Found => {}
            }
            for record in &slice.events {
                position = Some(record.event_number);
                self.publish_record(record);
            }
            if slice.is_end {
                break;
            }
            from = slice.next_event_number;
        }

        // Stage two: catch-up subscription from the recorded position; the
        // store dedups events racing the switch.
        let queue = Arc::clone(&self.queue);
        let registry = Arc::clone(&self.registry);
        let failures = Arc::clone(&self.decode_failures);
        let listener_name = self.name.clone();
        let phase = Arc::clone(&self.phase);
        let subscription = self.store.catch_up_subscribe(
            stream,
            position,
            Box::new(move |record| {
                match decode_recorded(&registry, &record) {
                    Ok(Some(message)) => queue.enqueue(message),
                    Ok(None) => {
                        failures.fetch_add(1, Ordering::SeqCst);
                        warn!(
                            listener = %listener_name,
                            event_type = %record.event_type,
                            event_number = record.event_number,
                            "skipping event with unknown type"
                        );
                    }
                    Err(err) => {
                        failures.fetch_add(1, Ordering::SeqCst);
                        warn!(listener = %listener_name, error = %err, "event decode failed");
                    }
                }
            }),
            Box::new(move || phase.set(ListenerPhase::Live)),
        )?;
        *self.subscription.lock().expect("listener lock poisoned") = Some(subscription);

        if block_until_live {
            self.phase.wait_for_live(|| self.is_failed());
        }
        Ok(())
    }

    fn publish_record(&self, record: &crate::store::RecordedEvent) {
        match decode_recorded(&self.registry, record) {
            Ok(Some(message)) => self.queue.enqueue(message),
            Ok(None) => {
                self.decode_failures.fetch_add(1, Ordering::SeqCst);
                warn!(
                    listener = %self.name,
                    event_type = %record.event_type,
                    event_number = record.event_number,
                    "skipping event with unknown type"
                );
            }
            Err(err) => {
                self.decode_failures.fetch_add(1, Ordering::SeqCst);
                warn!(listener = %self.name, error = %err, "event decode failed");
            }
        }
    }

    pub fn phase(&self) -> ListenerPhase {
        self.phase.get()
    }

    pub fn is_live(&self) -> bool {
        self.phase.get() == ListenerPhase::Live
    }

    /// True iff every published event has been handled and none are pending.
    pub fn idle(&self) -> bool {
        self.queue.idle()
    }

    /// Unhealthy: the store dropped the subscription, or events could not be
    /// decoded. The listener never silently skips events.
    pub fn is_failed(&self) -> bool {
        if self.decode_failures.load(Ordering::SeqCst) > 0 {
            return true;
        }
        let guard = self.subscription.lock().expect("listener lock poisoned");
        matches!(
            guard.as_ref().and_then(|s| s.drop_reason()),
            Some(reason) if reason != SubscriptionDropReason::Unsubscribed
        )
    }

    pub fn stop(&self) {
        if let Some(subscription) = self.subscription.lock().expect("listener lock poisoned").take()
        {
            subscription.unsubscribe();
        }
        self.queue.stop();
    }
}

impl core::fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamListener")
            .field("name", &self.name)
            .field("phase", &self.phase.get())
            .finish()
    }
}

/// Building block for concrete read models: a listener plus typed
/// subscriptions on its internal event stream.
pub struct ReadModelBase {
    listener: StreamListener,
}

impl ReadModelBase {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn StreamStore>,
        namer: StreamNameBuilder,
        registry: Arc<MessageTypeRegistry>,
    ) -> Self {
        Self {
            listener: StreamListener::new(name, store, namer, registry),
        }
    }

    pub fn listener(&self) -> &StreamListener {
        &self.listener
    }

    /// Subscribe a projection handler to events of type `T` on the internal
    /// stream. Handlers run on the listener's worker, so projection state
    /// needs no locking against other handlers of the same read model.
    pub fn subscribe<T: Message>(
        &self,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.listener.event_stream().subscribe(handler)
    }

    pub fn subscribe_sink<T: Message>(
        &self,
        sink: Arc<dyn MessageSink>,
        include_derived: bool,
    ) -> SubscriptionHandle {
        self.listener
            .event_stream()
            .subscribe_sink::<T>(sink, include_derived)
    }

    pub fn start_category<A: AggregateKind>(
        &self,
        checkpoint: Option<i64>,
        block_until_live: bool,
    ) -> Result<(), ListenerError> {
        self.listener.start_category::<A>(checkpoint, block_until_live)
    }

    pub fn idle(&self) -> bool {
        self.listener.idle()
    }

    pub fn is_live(&self) -> bool {
        self.listener.is_live()
    }
}
