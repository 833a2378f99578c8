//! In-process messaging: the bus, queued handlers, command responses, and
//! the command envelope.

pub mod bus;
pub mod command;
pub mod envelope;
pub mod queued_handler;

pub use bus::{BusConfig, BusError, MessageBus, MessageSink, SubscriptionHandle};
pub use command::{CommandAck, CommandError, CommandResponse, FailureKind};
pub use envelope::{CommandEnvelope, Principal};
pub use queued_handler::{DiscardingQueuedHandler, QueuedHandler};
