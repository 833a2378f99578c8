//! Message contracts: identity, correlation, command marker.
//!
//! Messages travel the bus as `Arc<dyn Message>`; handlers downcast through
//! `as_any`. Correlation lives on the message itself (not on an envelope), so
//! it survives persistence and the TCP wire unchanged.

use core::any::Any;

use crate::id::{CausationId, CorrelationId, MsgId};

/// A message: identified, thread-safe, downcastable.
///
/// `type_name` is the stable simple name used for routing and persistence
/// headers; `full_type_name` is the module-qualified legacy name kept for
/// cross-version decoding. Both must never change once events of the type
/// have been persisted.
pub trait Message: Any + Send + Sync + core::fmt::Debug {
    fn msg_id(&self) -> MsgId;

    /// Stable simple name (unique per module, may repeat across modules).
    fn type_name(&self) -> &'static str;

    /// Module-qualified name, written as a secondary header.
    fn full_type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

/// A message participating in a causal chain.
///
/// `correlation_id` is shared by every message in one logical operation;
/// `causation_id` is the `MsgId` of the direct cause. Both are `None` until
/// the message is stamped (by a correlated aggregate or at construction).
pub trait CorrelatedMessage: Message {
    fn correlation_id(&self) -> Option<CorrelationId>;

    fn causation_id(&self) -> Option<CausationId>;

    /// Stamp correlation data onto the message. Called once, before the
    /// message is recorded or dispatched.
    fn stamp(&mut self, correlation_id: CorrelationId, causation_id: CausationId);
}

/// Marker for messages that expect exactly one handled response.
pub trait CommandMessage: CorrelatedMessage {}

/// Correlation data copied out of a source message, so an aggregate can hold
/// it without holding the message itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SourceStamp {
    pub msg_id: MsgId,
    pub correlation_id: CorrelationId,
}

impl SourceStamp {
    pub fn of(source: &dyn CorrelatedMessage) -> Option<Self> {
        source.correlation_id().map(|correlation_id| Self {
            msg_id: source.msg_id(),
            correlation_id,
        })
    }

    /// Stamp for a message that begins a fresh causal chain.
    pub fn root(msg_id: MsgId) -> Self {
        Self {
            msg_id,
            correlation_id: CorrelationId::from_uuid(*msg_id.as_uuid()),
        }
    }
}

/// Implement [`Message`] for a struct with an `id: MsgId` field.
#[macro_export]
macro_rules! impl_message {
    ($t:ty) => {
        impl $crate::Message for $t {
            fn msg_id(&self) -> $crate::MsgId {
                self.id
            }

            fn type_name(&self) -> &'static str {
                stringify!($t)
            }

            fn full_type_name(&self) -> &'static str {
                concat!(module_path!(), "::", stringify!($t))
            }

            fn as_any(&self) -> &dyn core::any::Any {
                self
            }
        }
    };
}

/// Implement [`Message`] + [`CorrelatedMessage`] for a struct with `id`,
/// `correlation_id: Option<CorrelationId>` and `causation_id:
/// Option<CausationId>` fields.
#[macro_export]
macro_rules! impl_correlated_message {
    ($t:ty) => {
        $crate::impl_message!($t);

        impl $crate::CorrelatedMessage for $t {
            fn correlation_id(&self) -> Option<$crate::CorrelationId> {
                self.correlation_id
            }

            fn causation_id(&self) -> Option<$crate::CausationId> {
                self.causation_id
            }

            fn stamp(
                &mut self,
                correlation_id: $crate::CorrelationId,
                causation_id: $crate::CausationId,
            ) {
                self.correlation_id = Some(correlation_id);
                self.causation_id = Some(causation_id);
            }
        }
    };
}

/// Implement the full command contract for a struct (see
/// [`impl_correlated_message`] for the required fields).
#[macro_export]
macro_rules! impl_command_message {
    ($t:ty) => {
        $crate::impl_correlated_message!($t);

        impl $crate::CommandMessage for $t {}
    };
}
