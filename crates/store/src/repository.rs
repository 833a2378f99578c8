//! Aggregate persistence: load, save, and the correlated wrapper.
//!
//! Flow on save: take the aggregate's recorded events, enrich each with the
//! common type headers, the audit record and caller metadata, encode through
//! the registry, and append under the aggregate's expected version. Flow on
//! load: read the stream forward in slices, decode each record (simple name
//! first, legacy full name as fallback) and replay it into a fresh instance.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use rill_core::{
    Aggregate, AggregateError, AggregateId, AggregateKind, AuditRecord, CancelToken,
    CommonMetadata, CorrelatedAggregate, CorrelatedMessage, CorrelationId, Message,
    MessageTypeRegistry, Metadata, RegistryError, SourceStamp,
};

use crate::naming::StreamNameBuilder;
use crate::store::{
    EventData, ExpectedVersion, ReadState, RecordedEvent, StoreError, StreamStore,
};

pub const DEFAULT_SLICE_SIZE: usize = 100;

/// Yields the policy user recorded in each event's audit metadata.
pub type PolicyUserProvider = Arc<dyn Fn() -> Option<Uuid> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("stream {0} not found")]
    StreamNotFound(String),

    #[error("stream {0} has been deleted")]
    StreamDeleted(String),

    #[error("wrong expected version on {stream}: expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        stream: String,
        expected: i64,
        actual: i64,
    },

    #[error("event {event_number} on {stream} has unknown type {event_type}")]
    UnknownEventType {
        stream: String,
        event_number: i64,
        event_type: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    /// A correlated save requires a source and at least one event stamped
    /// with its correlation.
    #[error("aggregate has no events recorded under the source correlation")]
    MissingCorrelation,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl From<StoreError> for RepositoryError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::WrongExpectedVersion { stream, expected, actual } => {
                let expected = match expected {
                    ExpectedVersion::Exact(v) => v,
                    _ => rill_core::NO_STREAM,
                };
                Self::WrongExpectedVersion { stream, expected, actual }
            }
            StoreError::StreamDeleted(stream) => Self::StreamDeleted(stream),
            StoreError::Cancelled => Self::Cancelled,
            other => Self::Store(other),
        }
    }
}

/// Loads and saves aggregates against a stream store.
#[derive(Clone)]
pub struct StreamRepository {
    store: Arc<dyn StreamStore>,
    namer: StreamNameBuilder,
    registry: Arc<MessageTypeRegistry>,
    slice_size: usize,
    fully_qualify_type_names: bool,
    policy_user: Option<PolicyUserProvider>,
}

impl StreamRepository {
    pub fn new(
        store: Arc<dyn StreamStore>,
        namer: StreamNameBuilder,
        registry: Arc<MessageTypeRegistry>,
    ) -> Self {
        Self {
            store,
            namer,
            registry,
            slice_size: DEFAULT_SLICE_SIZE,
            fully_qualify_type_names: true,
            policy_user: None,
        }
    }

    pub fn with_slice_size(mut self, slice_size: usize) -> Self {
        self.slice_size = slice_size.max(1);
        self
    }

    pub fn with_fully_qualified_type_names(mut self, enabled: bool) -> Self {
        self.fully_qualify_type_names = enabled;
        self
    }

    pub fn with_policy_user_provider(mut self, provider: PolicyUserProvider) -> Self {
        self.policy_user = Some(provider);
        self
    }

    pub fn namer(&self) -> &StreamNameBuilder {
        &self.namer
    }

    pub fn registry(&self) -> &Arc<MessageTypeRegistry> {
        &self.registry
    }

    /// Persist the aggregate's recorded events and advance its expected
    /// version to the store-assigned one. A no-op when nothing was recorded.
    pub fn save<A: AggregateKind>(
        &self,
        aggregate: &mut A,
        causation_id: Option<rill_core::CausationId>,
        correlation_id: Option<CorrelationId>,
        metadata: &Metadata,
    ) -> Result<(), RepositoryError> {
        let stream = self.namer.stream_for(A::KIND, aggregate.aggregate_id());
        let expected = ExpectedVersion::from_aggregate(aggregate.expected_version());

        let events = aggregate.take_events();
        if events.is_empty() {
            return Ok(());
        }

        let policy_user_id = self.policy_user.as_ref().and_then(|p| p());
        let mut batch = Vec::with_capacity(events.len());
        for event in &events {
            let encoded = self.registry.encode(event.as_ref())?;
            let mut bag = Metadata::new();
            bag.set(&CommonMetadata {
                event_name: encoded.type_name.clone(),
                event_full_type_name: if self.fully_qualify_type_names {
                    encoded.full_type_name.clone()
                } else {
                    String::new()
                },
            })?;
            bag.set(&AuditRecord {
                policy_user_id,
                event_date_utc: Utc::now(),
            })?;
            if let Some(correlation) = correlation_id {
                bag.set_raw("correlationId", serde_json::to_value(correlation)?);
            }
            if let Some(causation) = causation_id {
                bag.set_raw("causationId", serde_json::to_value(causation)?);
            }
            bag.merge(metadata);

            batch.push(EventData {
                event_id: event.msg_id(),
                event_type: encoded.type_name,
                data: encoded.body,
                metadata: bag.to_value(),
            });
        }

        let result = self.store.append(&stream, expected, batch)?;
        aggregate.set_expected_version(result.next_expected_version);
        Ok(())
    }

    /// Rehydrate an aggregate from its stream.
    pub fn get_by_id<A: AggregateKind>(
        &self,
        id: AggregateId,
        cancel: &CancelToken,
    ) -> Result<A, RepositoryError> {
        match self.try_get_by_id(id, cancel)? {
            Some(aggregate) => Ok(aggregate),
            None => {
                let stream = self.namer.stream_for(A::KIND, id);
                Err(RepositoryError::StreamNotFound(stream.as_str().to_string()))
            }
        }
    }

    /// Like [`StreamRepository::get_by_id`] but returns `None` for a stream
    /// that does not exist; a deleted stream is still an error.
    pub fn try_get_by_id<A: AggregateKind>(
        &self,
        id: AggregateId,
        cancel: &CancelToken,
    ) -> Result<Option<A>, RepositoryError> {
        let stream = self.namer.stream_for(A::KIND, id);
        let mut aggregate = A::create(id);
        let mut from = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RepositoryError::Cancelled);
            }
            let slice = self.store.read_forward(&stream, from, self.slice_size, cancel)?;
            match slice.state {
                ReadState::NotFound => return Ok(None),
                ReadState::Deleted => {
                    return Err(RepositoryError::StreamDeleted(stream.as_str().to_string()));
                }
                ReadState::Found => {}
            }
            for record in &slice.events {
                let message = self.decode_record(record)?;
                aggregate.restore_from_event(message)?;
            }
            if slice.is_end {
                break;
            }
            from = slice.next_event_number;
        }
        Ok(Some(aggregate))
    }

    /// Apply events appended since the aggregate was loaded; used to refresh
    /// before retrying after a concurrency failure.
    pub fn update<A: AggregateKind>(
        &self,
        aggregate: &mut A,
        cancel: &CancelToken,
    ) -> Result<(), RepositoryError> {
        let stream = self.namer.stream_for(A::KIND, aggregate.aggregate_id());
        let mut from = aggregate.expected_version() + 1;
        loop {
            if cancel.is_cancelled() {
                return Err(RepositoryError::Cancelled);
            }
            let slice = self.store.read_forward(&stream, from, self.slice_size, cancel)?;
            match slice.state {
                ReadState::NotFound => {
                    return Err(RepositoryError::StreamNotFound(stream.as_str().to_string()));
                }
                ReadState::Deleted => {
                    return Err(RepositoryError::StreamDeleted(stream.as_str().to_string()));
                }
                ReadState::Found => {}
            }
            for record in &slice.events {
                let message = self.decode_record(record)?;
                aggregate.restore_from_event(message)?;
            }
            if slice.is_end {
                return Ok(());
            }
            from = slice.next_event_number;
        }
    }

    /// Decode one record; an unknown type is an error here, since skipping
    /// events would corrupt aggregate state.
    pub fn decode_record(&self, record: &RecordedEvent) -> Result<Arc<dyn Message>, RepositoryError> {
        decode_recorded(&self.registry, record)?.ok_or_else(|| RepositoryError::UnknownEventType {
            stream: record.stream.as_str().to_string(),
            event_number: record.event_number,
            event_type: record.event_type.clone(),
        })
    }
}

/// Decode a stored record via its metadata type headers, falling back to the
/// record's own event type column. Returns `None` for a type the registry
/// does not know (unless the registry is strict).
pub fn decode_recorded(
    registry: &MessageTypeRegistry,
    record: &RecordedEvent,
) -> Result<Option<Arc<dyn Message>>, RegistryError> {
    let bag = Metadata::from_value(record.metadata.clone());
    let (simple, full) = match bag.get::<CommonMetadata>() {
        Some(common) => {
            let full =
                (!common.event_full_type_name.is_empty()).then_some(common.event_full_type_name);
            (common.event_name, full)
        }
        None => (record.event_type.clone(), None),
    };
    registry.decode(&simple, full.as_deref(), record.data.clone())
}

/// Repository wrapper that keeps the causal chain intact: loads assign the
/// source message, saves require events recorded under its correlation.
#[derive(Clone)]
pub struct CorrelatedRepository {
    inner: StreamRepository,
}

impl CorrelatedRepository {
    pub fn new(inner: StreamRepository) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &StreamRepository {
        &self.inner
    }

    /// Fresh aggregate with the source assigned, for streams not yet born.
    pub fn create<A>(&self, id: AggregateId, source: &dyn CorrelatedMessage) -> Result<A, RepositoryError>
    where
        A: AggregateKind + CorrelatedAggregate,
    {
        let stamp = SourceStamp::of(source).ok_or(RepositoryError::MissingCorrelation)?;
        let mut aggregate = A::create(id);
        aggregate.set_source(stamp);
        Ok(aggregate)
    }

    pub fn get_by_id<A>(
        &self,
        id: AggregateId,
        source: &dyn CorrelatedMessage,
        cancel: &CancelToken,
    ) -> Result<A, RepositoryError>
    where
        A: AggregateKind + CorrelatedAggregate,
    {
        let stamp = SourceStamp::of(source).ok_or(RepositoryError::MissingCorrelation)?;
        let mut aggregate: A = self.inner.get_by_id(id, cancel)?;
        aggregate.set_source(stamp);
        Ok(aggregate)
    }

    pub fn try_get_by_id<A>(
        &self,
        id: AggregateId,
        source: &dyn CorrelatedMessage,
        cancel: &CancelToken,
    ) -> Result<Option<A>, RepositoryError>
    where
        A: AggregateKind + CorrelatedAggregate,
    {
        let stamp = SourceStamp::of(source).ok_or(RepositoryError::MissingCorrelation)?;
        let mut aggregate: Option<A> = self.inner.try_get_by_id(id, cancel)?;
        if let Some(aggregate) = aggregate.as_mut() {
            aggregate.set_source(stamp);
        }
        Ok(aggregate)
    }

    /// Save after asserting the batch was recorded under the source's
    /// correlation; the correlation and causation flow into the metadata.
    pub fn save<A>(&self, aggregate: &mut A, metadata: &Metadata) -> Result<(), RepositoryError>
    where
        A: AggregateKind + CorrelatedAggregate,
    {
        let source = aggregate.source().ok_or(RepositoryError::MissingCorrelation)?;
        if !aggregate.has_recorded_events()
            || !aggregate.recorded_correlation_matches(source.correlation_id)
        {
            return Err(RepositoryError::MissingCorrelation);
        }
        self.inner.save(
            aggregate,
            Some(source.msg_id.into()),
            Some(source.correlation_id),
            metadata,
        )
    }
}
