//! Core contracts of the event-sourcing runtime: message identity and
//! correlation, the type/serializer registry, metadata, and the aggregate
//! model.

pub mod aggregate;
pub mod cancel;
pub mod id;
pub mod message;
pub mod metadata;
pub mod registry;

pub use aggregate::{
    Aggregate, AggregateError, AggregateKind, CorrelatedAggregate, CorrelatedRoot,
    EventSourcedRoot, NO_STREAM, SnapshotSource,
};
pub use cancel::CancelToken;
pub use id::{AggregateId, CausationId, CorrelationId, InvalidId, MsgId};
pub use message::{CommandMessage, CorrelatedMessage, Message, SourceStamp};
pub use metadata::{AuditRecord, CommonMetadata, Metadata, MetadatumEntry};
pub use registry::{EncodedMessage, MessageTypeInfo, MessageTypeRegistry, RegistryError};
