//! Command dispatch results.
//!
//! Every dispatched command resolves to exactly one [`CommandResponse`],
//! which is itself a message: the bus returns it to the sender and publishes
//! it, so a TCP bridge can route it back to the process that carried the
//! original command.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rill_core::{CausationId, CorrelationId, MsgId};

/// Published as soon as a command's dispatch has been accepted by its
/// handler's worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    pub id: MsgId,
    pub command_id: MsgId,
    pub command_type: String,
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
}

rill_core::impl_correlated_message!(CommandAck);

/// Why a command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// No handler registered for the command type.
    Unsubscribed,
    /// Dispatch was not acknowledged in time.
    AckTimeout,
    /// The handler did not complete in time.
    ResponseTimeout,
    /// The handler returned or raised an error.
    Handler,
    /// A policy denied the command before dispatch.
    AccessDenied,
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let label = match self {
            FailureKind::Unsubscribed => "no handler subscribed",
            FailureKind::AckTimeout => "ack timeout",
            FailureKind::ResponseTimeout => "response timeout",
            FailureKind::Handler => "handler failed",
            FailureKind::AccessDenied => "access denied",
        };
        f.write_str(label)
    }
}

/// Terminal result of one command dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandResponse {
    Success {
        id: MsgId,
        command_id: MsgId,
        command_type: String,
        correlation_id: Option<CorrelationId>,
        causation_id: Option<CausationId>,
    },
    Fail {
        id: MsgId,
        command_id: MsgId,
        command_type: String,
        correlation_id: Option<CorrelationId>,
        causation_id: Option<CausationId>,
        kind: FailureKind,
        error: String,
    },
}

impl CommandResponse {
    pub fn success(
        command_id: MsgId,
        command_type: impl Into<String>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self::Success {
            id: MsgId::new(),
            command_id,
            command_type: command_type.into(),
            correlation_id,
            causation_id: Some(command_id.into()),
        }
    }

    pub fn fail(
        command_id: MsgId,
        command_type: impl Into<String>,
        correlation_id: Option<CorrelationId>,
        kind: FailureKind,
        error: impl Into<String>,
    ) -> Self {
        Self::Fail {
            id: MsgId::new(),
            command_id,
            command_type: command_type.into(),
            correlation_id,
            causation_id: Some(command_id.into()),
            kind,
            error: error.into(),
        }
    }

    pub fn command_id(&self) -> MsgId {
        match self {
            Self::Success { command_id, .. } | Self::Fail { command_id, .. } => *command_id,
        }
    }

    pub fn command_type(&self) -> &str {
        match self {
            Self::Success { command_type, .. } | Self::Fail { command_type, .. } => command_type,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn failure(&self) -> Option<(FailureKind, &str)> {
        match self {
            Self::Success { .. } => None,
            Self::Fail { kind, error, .. } => Some((*kind, error)),
        }
    }
}

impl rill_core::Message for CommandResponse {
    fn msg_id(&self) -> MsgId {
        match self {
            Self::Success { id, .. } | Self::Fail { id, .. } => *id,
        }
    }

    fn type_name(&self) -> &'static str {
        "CommandResponse"
    }

    fn full_type_name(&self) -> &'static str {
        concat!(module_path!(), "::CommandResponse")
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}

impl rill_core::CorrelatedMessage for CommandResponse {
    fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::Success { correlation_id, .. } | Self::Fail { correlation_id, .. } => {
                *correlation_id
            }
        }
    }

    fn causation_id(&self) -> Option<CausationId> {
        match self {
            Self::Success { causation_id, .. } | Self::Fail { causation_id, .. } => *causation_id,
        }
    }

    fn stamp(&mut self, correlation: CorrelationId, causation: CausationId) {
        match self {
            Self::Success { correlation_id, causation_id, .. }
            | Self::Fail { correlation_id, causation_id, .. } => {
                *correlation_id = Some(correlation);
                *causation_id = Some(causation);
            }
        }
    }
}

/// The failure branch collapsed to an error, for callers using the throwing
/// `send` variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("command {command_type} ({command_id}) failed: {kind}: {message}")]
pub struct CommandError {
    pub command_id: MsgId,
    pub command_type: String,
    pub kind: FailureKind,
    pub message: String,
}

impl CommandError {
    pub fn from_response(response: &CommandResponse) -> Option<Self> {
        match response {
            CommandResponse::Success { .. } => None,
            CommandResponse::Fail { command_id, command_type, kind, error, .. } => Some(Self {
                command_id: *command_id,
                command_type: command_type.clone(),
                kind: *kind,
                message: error.clone(),
            }),
        }
    }
}
