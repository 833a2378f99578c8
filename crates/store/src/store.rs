//! Stream store abstraction.
//!
//! An append-only log of event records addressed by stream name, with
//! optimistic concurrency on append, sliced forward reads, and live
//! subscriptions that can catch up from a checkpoint without gaps.
//! Concrete backends (in-memory for tests/dev, an external event store in
//! production) plug in behind [`StreamStore`]; the on-disk format is owned by
//! the backend.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use rill_core::{CancelToken, MsgId};

/// Name of one append-only stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamName(String);

impl StreamName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for system streams such as `$ce-` categories.
    pub fn is_system(&self) -> bool {
        self.0.starts_with('$')
    }
}

impl core::fmt::Display for StreamName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Concurrency expectation carried by an append.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The stream must not exist yet.
    NoStream,
    /// Append regardless of the current version.
    Any,
    /// The last event number must be exactly this.
    Exact(i64),
}

impl ExpectedVersion {
    /// Translate an aggregate's expected version (`-1` = unborn stream).
    pub fn from_aggregate(version: i64) -> Self {
        if version < 0 {
            Self::NoStream
        } else {
            Self::Exact(version)
        }
    }

    /// `current` is the last event number, or `None` for an unborn stream.
    pub fn matches(&self, current: Option<i64>) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current.is_none(),
            Self::Exact(expected) => current == Some(*expected),
        }
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoStream => f.write_str("no-stream"),
            Self::Any => f.write_str("any"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// An event ready to be appended (no event number assigned yet).
#[derive(Debug, Clone)]
pub struct EventData {
    pub event_id: MsgId,
    pub event_type: String,
    pub data: JsonValue,
    pub metadata: JsonValue,
}

/// A stored event record.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub stream: StreamName,
    /// Zero-based position within `stream`.
    pub event_number: i64,
    pub event_id: MsgId,
    pub event_type: String,
    pub data: JsonValue,
    pub metadata: JsonValue,
    pub created: DateTime<Utc>,
}

/// Outcome classification of a forward read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadState {
    Found,
    NotFound,
    Deleted,
}

/// A bounded batch of events returned by a forward read.
#[derive(Debug, Clone)]
pub struct StreamSlice {
    pub state: ReadState,
    pub events: Vec<RecordedEvent>,
    /// Where the next read should start.
    pub next_event_number: i64,
    pub is_end: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteResult {
    /// The expected version a subsequent append should carry.
    pub next_expected_version: i64,
}

/// Why a subscription stopped delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDropReason {
    Unsubscribed,
    StoreShutdown,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("wrong expected version on {stream}: expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        stream: String,
        expected: ExpectedVersion,
        /// Last event number, `-1` for an unborn stream.
        actual: i64,
    },

    #[error("stream {0} has been deleted")]
    StreamDeleted(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("store failure: {0}")]
    Internal(String),
}

pub type OnEvent = dyn Fn(RecordedEvent) + Send + Sync;
pub type OnLive = dyn FnOnce() + Send;

/// Handle to one live or catch-up subscription.
///
/// Events stop after `unsubscribe`; a reason other than `Unsubscribed` means
/// the store dropped the subscription and the consumer should treat itself as
/// unhealthy.
pub struct StoreSubscription {
    stop: Box<dyn FnOnce() + Send>,
    drop_reason: Arc<std::sync::Mutex<Option<SubscriptionDropReason>>>,
}

impl StoreSubscription {
    pub fn new(
        stop: Box<dyn FnOnce() + Send>,
        drop_reason: Arc<std::sync::Mutex<Option<SubscriptionDropReason>>>,
    ) -> Self {
        Self { stop, drop_reason }
    }

    pub fn unsubscribe(self) {
        (self.stop)();
    }

    pub fn drop_reason(&self) -> Option<SubscriptionDropReason> {
        *self.drop_reason.lock().expect("subscription lock poisoned")
    }
}

impl core::fmt::Debug for StoreSubscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoreSubscription")
            .field("drop_reason", &self.drop_reason())
            .finish()
    }
}

/// Append-only stream store.
pub trait StreamStore: Send + Sync {
    /// Append events, enforcing the expected version. Returns the next
    /// expected version for the stream.
    fn append(
        &self,
        stream: &StreamName,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult, StoreError>;

    /// Read forward from `from` (inclusive), at most `count` events.
    fn read_forward(
        &self,
        stream: &StreamName,
        from: i64,
        count: usize,
        cancel: &CancelToken,
    ) -> Result<StreamSlice, StoreError>;

    /// Deliver every event after `from_exclusive` (or from the beginning when
    /// `None`), in stream order, then keep delivering live appends.
    fn subscribe(
        &self,
        stream: &StreamName,
        from_exclusive: Option<i64>,
        on_event: Box<OnEvent>,
    ) -> Result<StoreSubscription, StoreError>;

    /// Like [`StreamStore::subscribe`], additionally invoking `on_live` once
    /// the historical read has completed and delivery has switched to live
    /// appends. Events racing the switch are deduplicated by event number:
    /// none delivered twice, none skipped.
    fn catch_up_subscribe(
        &self,
        stream: &StreamName,
        last_checkpoint: Option<i64>,
        on_event: Box<OnEvent>,
        on_live: Box<OnLive>,
    ) -> Result<StoreSubscription, StoreError>;

    /// Tombstone the stream; later reads classify as `Deleted`.
    fn delete_stream(&self, stream: &StreamName) -> Result<(), StoreError>;
}

impl<S> StreamStore for Arc<S>
where
    S: StreamStore + ?Sized,
{
    fn append(
        &self,
        stream: &StreamName,
        expected: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult, StoreError> {
        (**self).append(stream, expected, events)
    }

    fn read_forward(
        &self,
        stream: &StreamName,
        from: i64,
        count: usize,
        cancel: &CancelToken,
    ) -> Result<StreamSlice, StoreError> {
        (**self).read_forward(stream, from, count, cancel)
    }

    fn subscribe(
        &self,
        stream: &StreamName,
        from_exclusive: Option<i64>,
        on_event: Box<OnEvent>,
    ) -> Result<StoreSubscription, StoreError> {
        (**self).subscribe(stream, from_exclusive, on_event)
    }

    fn catch_up_subscribe(
        &self,
        stream: &StreamName,
        last_checkpoint: Option<i64>,
        on_event: Box<OnEvent>,
        on_live: Box<OnLive>,
    ) -> Result<StoreSubscription, StoreError> {
        (**self).catch_up_subscribe(stream, last_checkpoint, on_event, on_live)
    }

    fn delete_stream(&self, stream: &StreamName) -> Result<(), StoreError> {
        (**self).delete_stream(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_version_matching() {
        assert!(ExpectedVersion::Any.matches(None));
        assert!(ExpectedVersion::Any.matches(Some(7)));

        assert!(ExpectedVersion::NoStream.matches(None));
        assert!(!ExpectedVersion::NoStream.matches(Some(0)));

        assert!(ExpectedVersion::Exact(2).matches(Some(2)));
        assert!(!ExpectedVersion::Exact(2).matches(Some(3)));
        assert!(!ExpectedVersion::Exact(2).matches(None));
    }

    #[test]
    fn aggregate_version_translation() {
        assert_eq!(
            ExpectedVersion::from_aggregate(rill_core::NO_STREAM),
            ExpectedVersion::NoStream
        );
        assert_eq!(ExpectedVersion::from_aggregate(0), ExpectedVersion::Exact(0));
        assert_eq!(ExpectedVersion::from_aggregate(41), ExpectedVersion::Exact(41));
    }

    #[test]
    fn system_streams_are_flagged() {
        assert!(StreamName::new("$ce-group").is_system());
        assert!(!StreamName::new("group-1234").is_system());
    }
}
