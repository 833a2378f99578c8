//! Strongly-typed identifiers used across the runtime.
//!
//! Each id is a distinct uuid newtype so a causation id can never be handed
//! where a correlation id belongs. New ids are UUIDv7 and therefore sort by
//! creation time, which keeps id-keyed maps and logs roughly chronological.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An identifier string failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identifier: {0}")]
pub struct InvalidId(pub String);

/// Declares a uuid-backed id type with the conversions every id needs.
macro_rules! uuid_id {
    ($(#[$doc:meta])* $t:ident) => {
        $(#[$doc])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Mint a fresh, time-ordered identifier. Tests that need a
            /// stable id should build one from a known uuid instead.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::from_str(s)
                    .map(Self)
                    .map_err(|_| InvalidId(format!("{s:?} is not a {}", stringify!($t))))
            }
        }
    };
}

uuid_id! {
    /// Identity of a single message.
    MsgId
}

uuid_id! {
    /// Process-scope trace id shared by all causally related messages.
    CorrelationId
}

uuid_id! {
    /// The [`MsgId`] of a message's direct cause.
    CausationId
}

uuid_id! {
    /// Identifier of an aggregate root.
    AggregateId
}

impl From<MsgId> for CausationId {
    fn from(value: MsgId) -> Self {
        Self(value.0)
    }
}

impl AggregateId {
    /// Hex form without hyphens, as embedded in stream names.
    pub fn to_simple_string(&self) -> String {
        self.0.simple().to_string()
    }
}
