//! Correlated command envelope.
//!
//! Carries a command together with the principal on whose behalf it is sent
//! and the metadata that should follow it into the audit trail. Immutable:
//! every setter returns a new envelope with one field changed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rill_core::{
    CommandMessage, CorrelatedMessage, CorrelationId, Message, Metadata, MsgId, SourceStamp,
};

/// The identity a command is executed as. Lookup against a directory is out
/// of scope; this is the resolved value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub name: String,
    pub provider: String,
}

impl Principal {
    pub fn system() -> Self {
        Self {
            id: Uuid::nil(),
            name: "system".to_string(),
            provider: "local".to_string(),
        }
    }
}

/// Immutable carrier for one command dispatch.
#[derive(Clone)]
pub struct CommandEnvelope {
    command_id: MsgId,
    correlation_id: CorrelationId,
    source_id: Option<MsgId>,
    command: Arc<dyn CommandMessage>,
    metadata: Metadata,
    principal: Principal,
}

impl CommandEnvelope {
    /// Wrap a command. An unstamped command gets a fresh root correlation;
    /// a stamped one keeps its chain.
    pub fn new<C: CommandMessage>(mut command: C, principal: Principal) -> Self {
        let correlation_id = match command.correlation_id() {
            Some(existing) => existing,
            None => {
                let stamp = SourceStamp::root(command.msg_id());
                command.stamp(stamp.correlation_id, stamp.msg_id.into());
                stamp.correlation_id
            }
        };
        Self {
            command_id: command.msg_id(),
            correlation_id,
            source_id: None,
            command: Arc::new(command),
            metadata: Metadata::new(),
            principal,
        }
    }

    pub fn command_id(&self) -> MsgId {
        self.command_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn source_id(&self) -> Option<MsgId> {
        self.source_id
    }

    pub fn command(&self) -> &Arc<dyn CommandMessage> {
        &self.command
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn with_source(&self, source_id: MsgId) -> Self {
        let mut next = self.clone();
        next.source_id = Some(source_id);
        next
    }

    pub fn with_metadata(&self, metadata: Metadata) -> Self {
        let mut next = self.clone();
        next.metadata = metadata;
        next
    }

    pub fn with_principal(&self, principal: Principal) -> Self {
        let mut next = self.clone();
        next.principal = principal;
        next
    }
}

impl core::fmt::Debug for CommandEnvelope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandEnvelope")
            .field("command_id", &self.command_id)
            .field("correlation_id", &self.correlation_id)
            .field("command_type", &self.command.type_name())
            .field("principal", &self.principal.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::CausationId;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct DoWork {
        id: MsgId,
        correlation_id: Option<CorrelationId>,
        causation_id: Option<CausationId>,
    }
    rill_core::impl_command_message!(DoWork);

    fn do_work() -> DoWork {
        DoWork {
            id: MsgId::new(),
            correlation_id: None,
            causation_id: None,
        }
    }

    #[test]
    fn wrapping_stamps_a_root_correlation() {
        let command = do_work();
        let command_id = command.id;
        let envelope = CommandEnvelope::new(command, Principal::system());

        assert_eq!(envelope.command_id(), command_id);
        assert_eq!(
            envelope.command().correlation_id(),
            Some(envelope.correlation_id())
        );
    }

    #[test]
    fn stamped_commands_keep_their_chain() {
        let mut command = do_work();
        let correlation = CorrelationId::new();
        command.stamp(correlation, MsgId::new().into());

        let envelope = CommandEnvelope::new(command, Principal::system());
        assert_eq!(envelope.correlation_id(), correlation);
    }

    #[test]
    fn setters_return_modified_copies() {
        let envelope = CommandEnvelope::new(do_work(), Principal::system());
        let source = MsgId::new();

        let with_source = envelope.with_source(source);
        assert_eq!(with_source.source_id(), Some(source));
        assert_eq!(envelope.source_id(), None);

        let mut metadata = Metadata::new();
        metadata.set_raw("origin", serde_json::json!("test"));
        let with_metadata = envelope.with_metadata(metadata);
        assert!(envelope.metadata().is_empty());
        assert!(with_metadata.metadata().get_raw("origin").is_some());

        let admin = Principal {
            id: Uuid::now_v7(),
            name: "admin".to_string(),
            provider: "local".to_string(),
        };
        let with_principal = envelope.with_principal(admin.clone());
        assert_eq!(with_principal.principal(), &admin);
        assert_eq!(envelope.principal().name, "system");
    }
}
