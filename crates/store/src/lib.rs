//! Stream persistence: the store abstraction and in-memory backend, stream
//! naming, the aggregate repository, read-model listeners, and the configured
//! connection that ties them together.

pub mod config;
pub mod in_memory;
pub mod listener;
pub mod naming;
pub mod repository;
pub mod store;


pub use config::{ConfigError, ConfiguredConnection, ConnectionSettings};
pub use in_memory::InMemoryStreamStore;
pub use listener::{ListenerError, ListenerPhase, ReadModelBase, StreamListener};
pub use naming::StreamNameBuilder;
pub use repository::{
    CorrelatedRepository, DEFAULT_SLICE_SIZE, PolicyUserProvider, RepositoryError,
    StreamRepository, decode_recorded,
};
pub use store::{
    EventData, ExpectedVersion, OnEvent, OnLive, ReadState, RecordedEvent, StoreError,
    StoreSubscription, StreamName, StreamSlice, StreamStore, SubscriptionDropReason, WriteResult,
};
