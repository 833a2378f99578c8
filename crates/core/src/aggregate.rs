//! Event-sourced aggregate runtime.
//!
//! State is mutated only by applying events through registered routes, keyed
//! by event type. [`EventSourcedRoot`] owns the state, the route table, the
//! event recorder and the expected version; [`CorrelatedRoot`] adds the
//! source-stamping rules for causal chains. Domain aggregates embed one of
//! the two and delegate the [`Aggregate`] surface to it.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::id::{AggregateId, CorrelationId};
use crate::message::{CorrelatedMessage, Message, SourceStamp};

/// Expected version of a stream that has never been written.
pub const NO_STREAM: i64 = -1;

#[derive(Debug, Error)]
pub enum AggregateError {
    /// A route for this event type is already installed.
    #[error("duplicate route for event type {0}")]
    DuplicateRoute(&'static str),

    /// An event was applied with no route registered for its type.
    #[error("no route registered for event type {0}")]
    MissingRoute(String),

    /// Events have been raised since the last `take_events`; restore would
    /// interleave replayed and recorded history.
    #[error("cannot restore: events have been raised since the last take")]
    RestoreAfterRaise,

    /// A correlated aggregate raised an event without a source assigned.
    #[error("cannot raise: no source message assigned")]
    NoSource,

    /// The event was already stamped with correlation data from a different
    /// causal chain.
    #[error("event carries foreign correlation {found}, source is {expected}")]
    ForeignCorrelation {
        expected: CorrelationId,
        found: CorrelationId,
    },

    #[error("snapshot failed: {0}")]
    Snapshot(String),
}

enum Route<S> {
    Typed(Box<dyn Fn(&mut S, &dyn Message) + Send>),
    Untyped(Box<dyn Fn(&mut S, &dyn Message) + Send>),
}

impl<S> Route<S> {
    fn apply(&self, state: &mut S, event: &dyn Message) {
        match self {
            Route::Typed(f) | Route::Untyped(f) => f(state, event),
        }
    }
}

/// Route table + recorder + version tracking over a state value.
pub struct EventSourcedRoot<S> {
    id: AggregateId,
    state: S,
    routes: HashMap<TypeId, Route<S>>,
    recorded: Vec<Arc<dyn Message>>,
    expected_version: i64,
    raised_since_take: bool,
}

impl<S: core::fmt::Debug> core::fmt::Debug for EventSourcedRoot<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSourcedRoot")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("expected_version", &self.expected_version)
            .field("recorded", &self.recorded.len())
            .finish()
    }
}

impl<S> EventSourcedRoot<S> {
    pub fn new(id: AggregateId, state: S) -> Self {
        Self {
            id,
            state,
            routes: HashMap::new(),
            recorded: Vec::new(),
            expected_version: NO_STREAM,
            raised_since_take: false,
        }
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn expected_version(&self) -> i64 {
        self.expected_version
    }

    /// Set after a successful save (server-assigned) or a snapshot restore.
    pub fn set_expected_version(&mut self, version: i64) {
        self.expected_version = version;
    }

    /// Install the route for event type `E`.
    ///
    /// At most one route per event type; typed and untyped registrations may
    /// not be mixed for the same type.
    pub fn register<E: Message>(
        &mut self,
        route: impl Fn(&mut S, &E) + Send + 'static,
    ) -> Result<(), AggregateError> {
        let type_id = TypeId::of::<E>();
        if self.routes.contains_key(&type_id) {
            return Err(AggregateError::DuplicateRoute(std::any::type_name::<E>()));
        }
        self.routes.insert(
            type_id,
            Route::Typed(Box::new(move |state, event| {
                if let Some(event) = event.as_any().downcast_ref::<E>() {
                    route(state, event);
                }
            })),
        );
        Ok(())
    }

    /// Install a route keyed by an explicit type id, receiving the event as a
    /// trait object.
    pub fn register_untyped(
        &mut self,
        type_id: TypeId,
        type_name: &'static str,
        route: impl Fn(&mut S, &dyn Message) + Send + 'static,
    ) -> Result<(), AggregateError> {
        if self.routes.contains_key(&type_id) {
            return Err(AggregateError::DuplicateRoute(type_name));
        }
        self.routes.insert(type_id, Route::Untyped(Box::new(route)));
        Ok(())
    }

    fn route(&mut self, event: &dyn Message) -> Result<(), AggregateError> {
        let type_id = event.as_any().type_id();
        let route = self
            .routes
            .get(&type_id)
            .ok_or_else(|| AggregateError::MissingRoute(event.type_name().to_string()))?;
        route.apply(&mut self.state, event);
        Ok(())
    }

    /// Route the event through its registered route, then record it.
    pub fn raise<E: Message>(&mut self, event: E) -> Result<(), AggregateError> {
        self.route(&event)?;
        self.recorded.push(Arc::new(event));
        self.raised_since_take = true;
        Ok(())
    }

    fn raise_arc(&mut self, event: Arc<dyn Message>) -> Result<(), AggregateError> {
        self.route(event.as_ref())?;
        self.recorded.push(event);
        self.raised_since_take = true;
        Ok(())
    }

    /// Replay one persisted event without recording it.
    pub fn restore_from_event(&mut self, event: Arc<dyn Message>) -> Result<(), AggregateError> {
        if self.raised_since_take {
            return Err(AggregateError::RestoreAfterRaise);
        }
        self.route(event.as_ref())?;
        self.expected_version += 1;
        Ok(())
    }

    /// Replay a sequence of persisted events in order.
    pub fn restore_from_events(
        &mut self,
        events: impl IntoIterator<Item = Arc<dyn Message>>,
    ) -> Result<(), AggregateError> {
        for event in events {
            self.restore_from_event(event)?;
        }
        Ok(())
    }

    /// Drain the recorded events in raise order.
    pub fn take_events(&mut self) -> Vec<Arc<dyn Message>> {
        self.raised_since_take = false;
        std::mem::take(&mut self.recorded)
    }

    pub fn has_recorded_events(&self) -> bool {
        !self.recorded.is_empty()
    }
}

/// [`EventSourcedRoot`] plus the source-stamping rules of a causal chain.
///
/// Every raised event inherits the source's correlation id and gets the
/// source's message id as its causation id. `take_events` clears the source,
/// so each batch of events must have one assigned.
pub struct CorrelatedRoot<S> {
    root: EventSourcedRoot<S>,
    source: Option<SourceStamp>,
    recorded_correlation: Option<CorrelationId>,
}

impl<S: core::fmt::Debug> core::fmt::Debug for CorrelatedRoot<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CorrelatedRoot")
            .field("root", &self.root)
            .field("source", &self.source)
            .finish()
    }
}

impl<S> CorrelatedRoot<S> {
    pub fn new(id: AggregateId, state: S) -> Self {
        Self {
            root: EventSourcedRoot::new(id, state),
            source: None,
            recorded_correlation: None,
        }
    }

    pub fn id(&self) -> AggregateId {
        self.root.id()
    }

    pub fn state(&self) -> &S {
        self.root.state()
    }

    pub fn expected_version(&self) -> i64 {
        self.root.expected_version()
    }

    pub fn set_expected_version(&mut self, version: i64) {
        self.root.set_expected_version(version);
    }

    pub fn register<E: Message>(
        &mut self,
        route: impl Fn(&mut S, &E) + Send + 'static,
    ) -> Result<(), AggregateError> {
        self.root.register(route)
    }

    pub fn set_source(&mut self, source: SourceStamp) {
        self.source = Some(source);
    }

    pub fn source(&self) -> Option<SourceStamp> {
        self.source
    }

    /// Stamp the event with the current source's correlation, then route and
    /// record it.
    pub fn raise<E: CorrelatedMessage>(&mut self, mut event: E) -> Result<(), AggregateError> {
        let source = self.source.ok_or(AggregateError::NoSource)?;
        if let Some(found) = event.correlation_id() {
            if found != source.correlation_id {
                return Err(AggregateError::ForeignCorrelation {
                    expected: source.correlation_id,
                    found,
                });
            }
        }
        event.stamp(source.correlation_id, source.msg_id.into());
        self.root.raise_arc(Arc::new(event))?;
        self.recorded_correlation = Some(source.correlation_id);
        Ok(())
    }

    pub fn restore_from_event(&mut self, event: Arc<dyn Message>) -> Result<(), AggregateError> {
        self.root.restore_from_event(event)
    }

    pub fn restore_from_events(
        &mut self,
        events: impl IntoIterator<Item = Arc<dyn Message>>,
    ) -> Result<(), AggregateError> {
        self.root.restore_from_events(events)
    }

    /// Drain the recorded events and clear the source; the next batch must
    /// assign a fresh one.
    pub fn take_events(&mut self) -> Vec<Arc<dyn Message>> {
        self.source = None;
        self.recorded_correlation = None;
        self.root.take_events()
    }

    pub fn has_recorded_events(&self) -> bool {
        self.root.has_recorded_events()
    }

    /// True iff the currently recorded batch was stamped with `correlation`.
    pub fn recorded_correlation_matches(&self, correlation: CorrelationId) -> bool {
        self.recorded_correlation == Some(correlation)
    }
}

/// Surface the repository needs from any aggregate.
pub trait Aggregate: Send {
    fn aggregate_id(&self) -> AggregateId;

    fn expected_version(&self) -> i64;

    fn set_expected_version(&mut self, version: i64);

    fn restore_from_event(&mut self, event: Arc<dyn Message>) -> Result<(), AggregateError>;

    fn take_events(&mut self) -> Vec<Arc<dyn Message>>;

    fn has_recorded_events(&self) -> bool;
}

/// Named, constructible aggregate kind; `KIND` feeds the stream name builder.
pub trait AggregateKind: Aggregate + Sized {
    const KIND: &'static str;

    fn create(id: AggregateId) -> Self;
}

/// Extra surface of aggregates whose events carry correlation.
pub trait CorrelatedAggregate: Aggregate {
    fn set_source(&mut self, source: SourceStamp);

    fn source(&self) -> Option<SourceStamp>;

    fn recorded_correlation_matches(&self, correlation: CorrelationId) -> bool;
}

/// Optional snapshot capability: capture state and later restore it without
/// replaying the stream. Taking a snapshot does not clear recorded events.
pub trait SnapshotSource {
    fn take_snapshot(&self) -> Result<serde_json::Value, AggregateError>;

    fn restore_from_snapshot(
        &mut self,
        snapshot: serde_json::Value,
        version: i64,
    ) -> Result<(), AggregateError>;
}

impl<S> SnapshotSource for EventSourcedRoot<S>
where
    S: serde::Serialize + serde::de::DeserializeOwned,
{
    fn take_snapshot(&self) -> Result<serde_json::Value, AggregateError> {
        serde_json::to_value(&self.state).map_err(|e| AggregateError::Snapshot(e.to_string()))
    }

    fn restore_from_snapshot(
        &mut self,
        snapshot: serde_json::Value,
        version: i64,
    ) -> Result<(), AggregateError> {
        self.state =
            serde_json::from_value(snapshot).map_err(|e| AggregateError::Snapshot(e.to_string()))?;
        self.expected_version = version;
        Ok(())
    }
}

impl<S> SnapshotSource for CorrelatedRoot<S>
where
    S: serde::Serialize + serde::de::DeserializeOwned,
{
    fn take_snapshot(&self) -> Result<serde_json::Value, AggregateError> {
        self.root.take_snapshot()
    }

    fn restore_from_snapshot(
        &mut self,
        snapshot: serde_json::Value,
        version: i64,
    ) -> Result<(), AggregateError> {
        self.root.restore_from_snapshot(snapshot, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CausationId, MsgId};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Incremented {
        id: MsgId,
        amount: i64,
        correlation_id: Option<CorrelationId>,
        causation_id: Option<CausationId>,
    }
    crate::impl_correlated_message!(Incremented);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Renamed {
        id: MsgId,
        name: String,
        correlation_id: Option<CorrelationId>,
        causation_id: Option<CausationId>,
    }
    crate::impl_correlated_message!(Renamed);

    fn incremented(amount: i64) -> Incremented {
        Incremented {
            id: MsgId::new(),
            amount,
            correlation_id: None,
            causation_id: None,
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct CounterState {
        total: i64,
        name: String,
    }

    fn counter_root() -> EventSourcedRoot<CounterState> {
        let mut root = EventSourcedRoot::new(AggregateId::new(), CounterState::default());
        root.register::<Incremented>(|s, e| s.total += e.amount).unwrap();
        root.register::<Renamed>(|s, e| s.name = e.name.clone()).unwrap();
        root
    }

    fn correlated_root() -> CorrelatedRoot<CounterState> {
        let mut root = CorrelatedRoot::new(AggregateId::new(), CounterState::default());
        root.register::<Incremented>(|s, e| s.total += e.amount).unwrap();
        root
    }

    #[test]
    fn duplicate_route_is_rejected() {
        let mut root = counter_root();
        let err = root.register::<Incremented>(|_, _| {}).unwrap_err();
        assert!(matches!(err, AggregateError::DuplicateRoute(_)));

        // Untyped registration for the same type is also a duplicate.
        let err = root
            .register_untyped(TypeId::of::<Incremented>(), "Incremented", |_, _| {})
            .unwrap_err();
        assert!(matches!(err, AggregateError::DuplicateRoute(_)));
    }

    #[test]
    fn raise_routes_then_records_in_order() {
        let mut root = counter_root();
        root.raise(incremented(2)).unwrap();
        root.raise(incremented(3)).unwrap();
        assert_eq!(root.state().total, 5);

        let events = root.take_events();
        assert_eq!(events.len(), 2);
        let amounts: Vec<i64> = events
            .iter()
            .map(|e| e.as_any().downcast_ref::<Incremented>().unwrap().amount)
            .collect();
        assert_eq!(amounts, vec![2, 3]);

        // Recording idempotence: a second take returns nothing new.
        assert!(root.take_events().is_empty());
    }

    #[test]
    fn raise_without_route_is_missing_route() {
        let mut root = EventSourcedRoot::new(AggregateId::new(), CounterState::default());
        let err = root.raise(incremented(1)).unwrap_err();
        assert!(matches!(err, AggregateError::MissingRoute(_)));
    }

    #[test]
    fn restore_advances_expected_version_without_recording() {
        let mut root = counter_root();
        assert_eq!(root.expected_version(), NO_STREAM);

        let history: Vec<Arc<dyn Message>> =
            vec![Arc::new(incremented(1)), Arc::new(incremented(4))];
        root.restore_from_events(history).unwrap();

        assert_eq!(root.expected_version(), 1);
        assert_eq!(root.state().total, 5);
        assert!(root.take_events().is_empty());
    }

    #[test]
    fn restore_after_raise_is_rejected() {
        let mut root = counter_root();
        root.raise(incremented(1)).unwrap();

        let err = root
            .restore_from_event(Arc::new(incremented(2)))
            .unwrap_err();
        assert!(matches!(err, AggregateError::RestoreAfterRaise));

        // Taking the events re-enables restore.
        root.take_events();
        root.restore_from_event(Arc::new(incremented(2))).unwrap();
    }

    #[test]
    fn correlated_raise_requires_a_source() {
        let mut root = correlated_root();
        let err = root.raise(incremented(1)).unwrap_err();
        assert!(matches!(err, AggregateError::NoSource));
    }

    #[test]
    fn raised_events_inherit_source_correlation_and_causation() {
        let mut root = correlated_root();
        let source = SourceStamp::root(MsgId::new());
        root.set_source(source);

        root.raise(incremented(1)).unwrap();
        root.raise(incremented(2)).unwrap();
        assert!(root.recorded_correlation_matches(source.correlation_id));

        for event in root.take_events() {
            let event = event.as_any().downcast_ref::<Incremented>().unwrap();
            assert_eq!(event.correlation_id, Some(source.correlation_id));
            assert_eq!(event.causation_id, Some(source.msg_id.into()));
        }
    }

    #[test]
    fn foreign_correlation_is_rejected() {
        let mut root = correlated_root();
        root.set_source(SourceStamp::root(MsgId::new()));

        let mut event = incremented(1);
        event.stamp(CorrelationId::new(), MsgId::new().into());
        let err = root.raise(event).unwrap_err();
        assert!(matches!(err, AggregateError::ForeignCorrelation { .. }));
    }

    #[test]
    fn snapshots_capture_state_without_clearing_the_recorder() {
        let mut root = counter_root();
        root.restore_from_event(Arc::new(incremented(5))).unwrap();
        root.raise(incremented(3)).unwrap();

        let snapshot = root.take_snapshot().unwrap();
        assert!(root.has_recorded_events(), "snapshot leaves the recorder alone");

        let mut restored = counter_root();
        restored.restore_from_snapshot(snapshot, root.expected_version()).unwrap();
        assert_eq!(restored.state().total, 8);
        assert_eq!(restored.expected_version(), 0);
        assert!(!restored.has_recorded_events());
    }

    #[test]
    fn take_events_clears_the_source() {
        let mut root = correlated_root();
        root.set_source(SourceStamp::root(MsgId::new()));
        root.raise(incremented(1)).unwrap();

        let events = root.take_events();
        assert_eq!(events.len(), 1);
        assert!(root.source().is_none());

        // Source clearing: the next raise needs a fresh source.
        let err = root.raise(incremented(2)).unwrap_err();
        assert!(matches!(err, AggregateError::NoSource));
    }
}
