//! Effective permissions of the current user.
//!
//! A policy holds the user plus the roles in effect; the effective permission
//! set is the union of role permissions. A permission that names a message
//! type resolves to the concrete type on demand; names the registry cannot
//! resolve still match by simple name.

use std::any::TypeId;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rill_core::{CommandMessage, Message, MessageTypeRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDetails {
    pub user_id: Uuid,
    pub user_name: String,
}

/// One grantable capability, identified by name.
#[derive(Debug, Serialize, Deserialize)]
pub struct Permission {
    name: String,
    #[serde(skip)]
    resolved: OnceLock<TypeId>,
}

impl Clone for Permission {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            resolved: self.resolved.clone(),
        }
    }
}

impl Permission {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resolved: OnceLock::new(),
        }
    }

    /// Permission for a concrete command type, resolved up front.
    pub fn for_command<C: CommandMessage>() -> Self {
        let full = std::any::type_name::<C>();
        let name = full.rsplit("::").next().unwrap_or(full).to_string();
        let resolved = OnceLock::new();
        let _ = resolved.set(TypeId::of::<C>());
        Self { name, resolved }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff this permission covers the given command.
    ///
    /// Resolution is attempted lazily and cached only on success, so a type
    /// registered later is still picked up.
    pub fn matches(&self, registry: &MessageTypeRegistry, command: &dyn Message) -> bool {
        if let Some(type_id) = self.resolved.get() {
            return *type_id == command.as_any().type_id();
        }
        let candidates = registry.types_by_name(&self.name);
        if candidates.len() == 1 {
            let type_id = candidates[0].type_id;
            let _ = self.resolved.set(type_id);
            return type_id == command.as_any().type_id();
        }
        // Unresolved (or ambiguous) names match by simple name.
        self.name == command.type_name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub permissions: Vec<Permission>,
}

impl Role {
    pub fn new(id: Uuid, name: impl Into<String>, permissions: Vec<Permission>) -> Self {
        Self {
            id,
            name: name.into(),
            permissions,
        }
    }
}

/// A user plus the roles currently in effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPolicy {
    user: UserDetails,
    roles: Vec<Role>,
}

impl UserPolicy {
    pub fn new(user: UserDetails, roles: Vec<Role>) -> Self {
        Self { user, roles }
    }

    pub fn user(&self) -> &UserDetails {
        &self.user
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Union of role permissions.
    pub fn effective_permissions(&self) -> impl Iterator<Item = &Permission> {
        self.roles.iter().flat_map(|role| role.permissions.iter())
    }

    /// True iff any effective permission covers the command.
    pub fn grants(&self, registry: &MessageTypeRegistry, command: &dyn Message) -> bool {
        self.effective_permissions()
            .any(|permission| permission.matches(registry, command))
    }
}
