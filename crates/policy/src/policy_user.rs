//! PolicyUser aggregate: membership of a user in a policy, with roles.
//!
//! Role names compare case-insensitively. Adding a role the user already
//! holds (same id) is a no-op; the same name under a different id is a
//! conflict. Deactivation removes every held role event-by-event so
//! reactivation can emit the exact inverse.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use rill_core::{
    Aggregate, AggregateError, AggregateId, AggregateKind, CausationId, CorrelatedAggregate,
    CorrelatedRoot, CorrelationId, Message, MsgId, SourceStamp,
};

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyUserAdded {
    pub id: MsgId,
    pub policy_user_id: AggregateId,
    pub policy_id: Uuid,
    pub user_id: Uuid,
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
}
rill_core::impl_correlated_message!(PolicyUserAdded);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAdded {
    pub id: MsgId,
    pub policy_user_id: AggregateId,
    pub role_id: Uuid,
    pub role_name: String,
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
}
rill_core::impl_correlated_message!(RoleAdded);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRemoved {
    pub id: MsgId,
    pub policy_user_id: AggregateId,
    pub role_id: Uuid,
    pub role_name: String,
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
}
rill_core::impl_correlated_message!(RoleRemoved);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDeactivated {
    pub id: MsgId,
    pub policy_user_id: AggregateId,
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
}
rill_core::impl_correlated_message!(UserDeactivated);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserReactivated {
    pub id: MsgId,
    pub policy_user_id: AggregateId,
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
}
rill_core::impl_correlated_message!(UserReactivated);

/// Register every PolicyUser event type on a registry (one call per process
/// or re-scan).
pub fn register_event_types(
    registry: &rill_core::MessageTypeRegistry,
) -> Result<(), rill_core::RegistryError> {
    registry.register::<PolicyUserAdded>()?;
    registry.register::<RoleAdded>()?;
    registry.register::<RoleRemoved>()?;
    registry.register::<UserDeactivated>()?;
    registry.register::<UserReactivated>()?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum PolicyUserError {
    #[error("role name '{0}' already exists under a different id")]
    DuplicateRole(String),

    #[error("policy user does not exist yet")]
    NotCreated,

    #[error("policy user already exists")]
    AlreadyCreated,

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct PolicyUserState {
    policy_id: Option<Uuid>,
    user_id: Option<Uuid>,
    /// Lowercased name -> (role id, name as granted).
    roles: HashMap<String, (Uuid, String)>,
    active: bool,
    created: bool,
    /// Roles held at the moment of the last deactivation.
    roles_at_deactivation: Vec<(Uuid, String)>,
}

/// Membership of one user in one policy.
#[derive(Debug)]
pub struct PolicyUser {
    root: CorrelatedRoot<PolicyUserState>,
}

impl PolicyUser {
    /// Record the membership itself. Must be the first operation.
    pub fn add(&mut self, policy_id: Uuid, user_id: Uuid) -> Result<(), PolicyUserError> {
        if self.root.state().created {
            return Err(PolicyUserError::AlreadyCreated);
        }
        self.root.raise(PolicyUserAdded {
            id: MsgId::new(),
            policy_user_id: self.root.id(),
            policy_id,
            user_id,
            correlation_id: None,
            causation_id: None,
        })?;
        Ok(())
    }

    /// Grant a role. Granting a role already held (same id) is a no-op; the
    /// same name under a different id is a conflict.
    pub fn add_role(&mut self, name: &str, role_id: Uuid) -> Result<(), PolicyUserError> {
        self.ensure_created()?;
        if let Some((existing_id, _)) = self.root.state().roles.get(&name.to_lowercase()) {
            if *existing_id == role_id {
                return Ok(());
            }
            return Err(PolicyUserError::DuplicateRole(name.to_string()));
        }
        self.root.raise(RoleAdded {
            id: MsgId::new(),
            policy_user_id: self.root.id(),
            role_id,
            role_name: name.to_string(),
            correlation_id: None,
            causation_id: None,
        })?;
        Ok(())
    }

    /// Revoke a role by name; revoking an absent role is a no-op.
    pub fn remove_role(&mut self, name: &str) -> Result<(), PolicyUserError> {
        self.ensure_created()?;
        let Some((role_id, role_name)) = self.root.state().roles.get(&name.to_lowercase()).cloned()
        else {
            return Ok(());
        };
        self.root.raise(RoleRemoved {
            id: MsgId::new(),
            policy_user_id: self.root.id(),
            role_id,
            role_name,
            correlation_id: None,
            causation_id: None,
        })?;
        Ok(())
    }

    /// Deactivate: one deactivation event, then one role-removed event per
    /// currently held role.
    pub fn deactivate(&mut self) -> Result<(), PolicyUserError> {
        self.ensure_created()?;
        if !self.root.state().active {
            return Ok(());
        }
        self.root.raise(UserDeactivated {
            id: MsgId::new(),
            policy_user_id: self.root.id(),
            correlation_id: None,
            causation_id: None,
        })?;
        let held: Vec<(Uuid, String)> = self.root.state().roles.values().cloned().collect();
        for (role_id, role_name) in held {
            self.root.raise(RoleRemoved {
                id: MsgId::new(),
                policy_user_id: self.root.id(),
                role_id,
                role_name,
                correlation_id: None,
                causation_id: None,
            })?;
        }
        Ok(())
    }

    /// Reactivate: the inverse of deactivation, restoring the roles held at
    /// that time.
    pub fn reactivate(&mut self) -> Result<(), PolicyUserError> {
        self.ensure_created()?;
        if self.root.state().active {
            return Ok(());
        }
        let restored = self.root.state().roles_at_deactivation.clone();
        self.root.raise(UserReactivated {
            id: MsgId::new(),
            policy_user_id: self.root.id(),
            correlation_id: None,
            causation_id: None,
        })?;
        for (role_id, role_name) in restored {
            self.root.raise(RoleAdded {
                id: MsgId::new(),
                policy_user_id: self.root.id(),
                role_id,
                role_name,
                correlation_id: None,
                causation_id: None,
            })?;
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.root.state().active
    }

    pub fn role_names(&self) -> Vec<String> {
        self.root.state().roles.values().map(|(_, name)| name.clone()).collect()
    }

    fn ensure_created(&self) -> Result<(), PolicyUserError> {
        if self.root.state().created {
            Ok(())
        } else {
            Err(PolicyUserError::NotCreated)
        }
    }
}

impl Aggregate for PolicyUser {
    fn aggregate_id(&self) -> AggregateId {
        self.root.id()
    }

    fn expected_version(&self) -> i64 {
        self.root.expected_version()
    }

    fn set_expected_version(&mut self, version: i64) {
        self.root.set_expected_version(version);
    }

    fn restore_from_event(
        &mut self,
        event: std::sync::Arc<dyn Message>,
    ) -> Result<(), AggregateError> {
        self.root.restore_from_event(event)
    }

    fn take_events(&mut self) -> Vec<std::sync::Arc<dyn Message>> {
        self.root.take_events()
    }

    fn has_recorded_events(&self) -> bool {
        self.root.has_recorded_events()
    }
}

impl AggregateKind for PolicyUser {
    const KIND: &'static str = "PolicyUser";

    fn create(id: AggregateId) -> Self {
        let mut root = CorrelatedRoot::new(id, PolicyUserState::default());
        root.register::<PolicyUserAdded>(|s, e| {
            s.policy_id = Some(e.policy_id);
            s.user_id = Some(e.user_id);
            s.created = true;
            s.active = true;
        })
        .expect("fresh route table");
        root.register::<RoleAdded>(|s, e| {
            s.roles
                .insert(e.role_name.to_lowercase(), (e.role_id, e.role_name.clone()));
        })
        .expect("fresh route table");
        root.register::<RoleRemoved>(|s, e| {
            s.roles.remove(&e.role_name.to_lowercase());
        })
        .expect("fresh route table");
        root.register::<UserDeactivated>(|s, _| {
            s.active = false;
            s.roles_at_deactivation = s.roles.values().cloned().collect();
        })
        .expect("fresh route table");
        root.register::<UserReactivated>(|s, _| {
            s.active = true;
        })
        .expect("fresh route table");
        Self { root }
    }
}

impl CorrelatedAggregate for PolicyUser {
    fn set_source(&mut self, source: SourceStamp) {
        self.root.set_source(source);
    }

    fn source(&self) -> Option<SourceStamp> {
        self.root.source()
    }

    fn recorded_correlation_matches(&self, correlation: CorrelationId) -> bool {
        self.root.recorded_correlation_matches(correlation)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
