//! Permission-gated command dispatch over the bus.
//!
//! Callers hand over a [`CommandEnvelope`]; the dispatcher resolves the
//! envelope's principal to a [`UserPolicy`] through the provider, checks the
//! carried command against the policy's effective permissions, and only then
//! lets the bus dispatch it. The provider is consulted per dispatch, so a
//! policy change takes effect on the next send. Events pass through
//! unconditionally.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use rill_bus::{
    CommandEnvelope, CommandError, CommandResponse, FailureKind, MessageBus, Principal,
    SubscriptionHandle,
};
use rill_core::{CorrelatedMessage, Message};

use crate::user_policy::UserPolicy;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("not authorized to send {command_type}: {reason}")]
    AccessDenied {
        command_type: String,
        reason: String,
    },
}

/// Resolves the principal a command is executed as to the policy in effect
/// for it, at dispatch time.
pub type PolicyProvider = Arc<dyn Fn(&Principal) -> Arc<UserPolicy> + Send + Sync>;

/// Wraps a bus with a permission check on every command dispatch.
#[derive(Clone)]
pub struct PolicyDispatcher {
    bus: MessageBus,
    policy: PolicyProvider,
}

impl PolicyDispatcher {
    pub fn new(bus: MessageBus, policy: PolicyProvider) -> Self {
        Self { bus, policy }
    }

    /// The wrapped bus, for subscriptions and anything not permission-gated.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    fn check(&self, envelope: &CommandEnvelope) -> Result<(), AccessError> {
        let policy = (self.policy)(envelope.principal());
        let command = envelope.command().as_ref();
        if policy.grants(self.bus.registry(), command) {
            return Ok(());
        }
        debug!(
            command = command.type_name(),
            principal = %envelope.principal().name,
            user = %policy.user().user_name,
            "command denied by policy"
        );
        Err(AccessError::AccessDenied {
            command_type: command.type_name().to_string(),
            reason: format!("user {} holds no matching permission", policy.user().user_name),
        })
    }

    fn denial_error(envelope: &CommandEnvelope, denied: AccessError) -> CommandError {
        CommandError {
            command_id: envelope.command_id(),
            command_type: envelope.command().type_name().to_string(),
            kind: FailureKind::AccessDenied,
            message: denied.to_string(),
        }
    }

    pub fn send(&self, envelope: &CommandEnvelope) -> Result<CommandResponse, CommandError> {
        if let Err(denied) = self.check(envelope) {
            return Err(Self::denial_error(envelope, denied));
        }
        self.bus.send_envelope(envelope)
    }

    pub fn send_with_timeouts(
        &self,
        envelope: &CommandEnvelope,
        ack_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<CommandResponse, CommandError> {
        if let Err(denied) = self.check(envelope) {
            return Err(Self::denial_error(envelope, denied));
        }
        let response =
            self.bus
                .dispatch(Arc::clone(envelope.command()), ack_timeout, response_timeout);
        match CommandError::from_response(&response) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    pub fn try_send(&self, envelope: &CommandEnvelope) -> CommandResponse {
        match self.check(envelope) {
            Ok(()) => self.bus.try_send_envelope(envelope),
            Err(denied) => CommandResponse::fail(
                envelope.command_id(),
                envelope.command().type_name(),
                envelope.command().correlation_id(),
                FailureKind::AccessDenied,
                denied.to_string(),
            ),
        }
    }

    pub fn try_send_async(&self, envelope: &CommandEnvelope) -> bool {
        self.check(envelope).is_ok() && self.bus.dispatch_async(Arc::clone(envelope.command()))
    }

    /// Events are not permission-gated.
    pub fn publish(&self, message: Arc<dyn Message>) {
        self.bus.publish(message);
    }

    pub fn subscribe<T: Message>(
        &self,
        handler: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.bus.subscribe(handler)
    }
}
