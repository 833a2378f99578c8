//! Message type registry: name lookup, declared ancestry, per-type codecs.
//!
//! The registry is built explicitly at process start (and re-scanned when new
//! type collections are loaded) instead of reflecting over loaded code. Each
//! registration declares its parent type, so ancestor/descendant queries are
//! table walks; descendant sets are cached after first use.
//!
//! The registry doubles as the serializer registry: every registered type
//! carries serde-backed encode/decode functions keyed by the runtime type, so
//! the repository and the TCP wire codec share one source of truth for type
//! headers.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::message::{CommandMessage, Message};

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Two distinct types registered the same full name.
    #[error("duplicate message type name: {0}")]
    DuplicateTypeName(String),

    /// Lookup failed and the registry is configured to be strict.
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    /// The message's runtime type has no registration.
    #[error("unregistered message type: {0}")]
    UnregisteredType(&'static str),

    #[error("message encode failed for {type_name}: {source}")]
    Encode {
        type_name: &'static str,
        source: serde_json::Error,
    },

    #[error("message decode failed for {type_name}: {source}")]
    Decode {
        type_name: String,
        source: serde_json::Error,
    },
}

/// Public view of one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTypeInfo {
    pub type_id: TypeId,
    pub type_name: String,
    pub full_type_name: String,
    pub parent: Option<TypeId>,
}

/// A message serialized to its wire/persistence form.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    pub type_name: String,
    pub full_type_name: String,
    pub body: JsonValue,
}

type EncodeFn = fn(&dyn Message) -> Result<JsonValue, RegistryError>;
type DecodeFn = fn(JsonValue) -> Result<Arc<dyn Message>, RegistryError>;
type CommandCastFn = fn(&dyn Message) -> Option<Arc<dyn CommandMessage>>;

struct Registration {
    info: MessageTypeInfo,
    encode: EncodeFn,
    decode: DecodeFn,
    // Present only for command types; lets transports re-dispatch a decoded
    // trait object as a command.
    cast_command: Option<CommandCastFn>,
}

#[derive(Default)]
struct RegistryInner {
    registrations: Vec<Registration>,
    by_type_id: HashMap<TypeId, usize>,
    by_name: HashMap<String, Vec<usize>>,
    by_full_name: HashMap<String, usize>,
    // Descendant sets are derived data; cleared whenever a registration lands.
    descendants: HashMap<TypeId, Vec<TypeId>>,
}

/// Registry of all message types known to the process.
///
/// Shared as `Arc<MessageTypeRegistry>`; registration and lookup are both
/// safe from any thread. Results reflect only the types known at the last
/// registration call.
pub struct MessageTypeRegistry {
    inner: RwLock<RegistryInner>,
    throw_on_type_not_found: bool,
    namespace_override: Option<String>,
}

impl Default for MessageTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageTypeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            throw_on_type_not_found: false,
            namespace_override: None,
        }
    }

    /// Strict lookups: unknown names become errors instead of `None`.
    pub fn with_throw_on_type_not_found(mut self, strict: bool) -> Self {
        self.throw_on_type_not_found = strict;
        self
    }

    /// Substitute the leading path segment when resolving full names whose
    /// originating module has been renamed.
    pub fn with_namespace_override(mut self, namespace: impl Into<String>) -> Self {
        self.namespace_override = Some(namespace.into());
        self
    }

    /// Register a message type with no declared parent.
    pub fn register<T>(&self) -> Result<(), RegistryError>
    where
        T: Message + Serialize + DeserializeOwned,
    {
        self.insert::<T>(None, None)
    }

    /// Register a message type as a descendant of `P`.
    ///
    /// `P` must already be registered; ancestry is declared, not reflected.
    pub fn register_as<T, P>(&self) -> Result<(), RegistryError>
    where
        T: Message + Serialize + DeserializeOwned,
        P: Message,
    {
        self.insert::<T>(Some(TypeId::of::<P>()), None)
    }

    /// Register a command type, keeping its command nature recoverable after
    /// decode (see [`MessageTypeRegistry::try_as_command`]).
    pub fn register_command<T>(&self) -> Result<(), RegistryError>
    where
        T: CommandMessage + Clone + Serialize + DeserializeOwned,
    {
        self.insert::<T>(None, Some(cast_command_as::<T>))
    }

    fn insert<T>(
        &self,
        parent: Option<TypeId>,
        cast_command: Option<CommandCastFn>,
    ) -> Result<(), RegistryError>
    where
        T: Message + Serialize + DeserializeOwned,
    {
        let full = std::any::type_name::<T>().to_string();
        let simple = simple_name(&full).to_string();
        let type_id = TypeId::of::<T>();

        let mut inner = self.inner.write().expect("registry lock poisoned");

        if let Some(&idx) = inner.by_full_name.get(&full) {
            if inner.registrations[idx].info.type_id == type_id {
                // Re-scan of an already known collection.
                return Ok(());
            }
            return Err(RegistryError::DuplicateTypeName(full));
        }

        let idx = inner.registrations.len();
        inner.registrations.push(Registration {
            info: MessageTypeInfo {
                type_id,
                type_name: simple.clone(),
                full_type_name: full.clone(),
                parent,
            },
            encode: encode_as::<T>,
            decode: decode_as::<T>,
            cast_command,
        });
        inner.by_type_id.insert(type_id, idx);
        inner.by_name.entry(simple).or_default().push(idx);
        inner.by_full_name.insert(full, idx);
        inner.descendants.clear();
        Ok(())
    }

    /// All registered types with the given simple name.
    pub fn types_by_name(&self, name: &str) -> Vec<MessageTypeInfo> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .by_name
            .get(name)
            .map(|idxs| idxs.iter().map(|&i| inner.registrations[i].info.clone()).collect())
            .unwrap_or_default()
    }

    /// The unique type with the given full name, honoring the namespace
    /// override. Errors when strict lookups are enabled.
    pub fn type_by_full_name(&self, full: &str) -> Result<Option<MessageTypeInfo>, RegistryError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        if let Some(&idx) = inner.by_full_name.get(full) {
            return Ok(Some(inner.registrations[idx].info.clone()));
        }
        if let Some(ns) = &self.namespace_override {
            let overridden = override_namespace(full, ns);
            if let Some(&idx) = inner.by_full_name.get(&overridden) {
                return Ok(Some(inner.registrations[idx].info.clone()));
            }
        }
        if self.throw_on_type_not_found {
            return Err(RegistryError::UnknownMessageType(full.to_string()));
        }
        Ok(None)
    }

    pub fn info_of(&self, type_id: TypeId) -> Option<MessageTypeInfo> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .by_type_id
            .get(&type_id)
            .map(|&i| inner.registrations[i].info.clone())
    }

    /// The type itself followed by each declared parent, root last.
    ///
    /// An unregistered type yields just itself.
    pub fn ancestors_and_self(&self, type_id: TypeId) -> Vec<TypeId> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut chain = vec![type_id];
        let mut current = type_id;
        while let Some(&idx) = inner.by_type_id.get(&current) {
            match inner.registrations[idx].info.parent {
                Some(parent) if !chain.contains(&parent) => {
                    chain.push(parent);
                    current = parent;
                }
                _ => break,
            }
        }
        chain
    }

    /// The type itself plus every registered descendant, in registration
    /// order. Cached after first use; registrations invalidate the cache.
    pub fn descendants_and_self(&self, type_id: TypeId) -> Vec<TypeId> {
        {
            let inner = self.inner.read().expect("registry lock poisoned");
            if let Some(cached) = inner.descendants.get(&type_id) {
                return cached.clone();
            }
        }

        let mut inner = self.inner.write().expect("registry lock poisoned");
        let mut set = vec![type_id];
        let depth_limit = inner.registrations.len();
        for reg in &inner.registrations {
            let candidate = reg.info.type_id;
            if candidate == type_id {
                continue;
            }
            let mut current = reg.info.parent;
            let mut depth = 0;
            while let Some(parent) = current {
                if parent == type_id {
                    set.push(candidate);
                    break;
                }
                depth += 1;
                if depth > depth_limit {
                    break;
                }
                current = inner
                    .by_type_id
                    .get(&parent)
                    .and_then(|&i| inner.registrations[i].info.parent);
            }
        }
        inner.descendants.insert(type_id, set.clone());
        set
    }

    /// Serialize a message through its registered codec.
    pub fn encode(&self, message: &dyn Message) -> Result<EncodedMessage, RegistryError> {
        let type_id = message.as_any().type_id();
        let inner = self.inner.read().expect("registry lock poisoned");
        let &idx = inner
            .by_type_id
            .get(&type_id)
            .ok_or(RegistryError::UnregisteredType(message.type_name()))?;
        let reg = &inner.registrations[idx];
        let body = (reg.encode)(message)?;
        Ok(EncodedMessage {
            type_name: reg.info.type_name.clone(),
            full_type_name: reg.info.full_type_name.clone(),
            body,
        })
    }

    /// Deserialize a message from its stored form.
    ///
    /// Resolution order: unique simple name, then full name (legacy header),
    /// then full name with the namespace override applied. Returns `Ok(None)`
    /// for unknown types unless strict lookups are enabled.
    pub fn decode(
        &self,
        type_name: &str,
        full_type_name: Option<&str>,
        body: JsonValue,
    ) -> Result<Option<Arc<dyn Message>>, RegistryError> {
        let decode_fn = {
            let inner = self.inner.read().expect("registry lock poisoned");
            let idx = match inner.by_name.get(type_name) {
                Some(idxs) if idxs.len() == 1 => Some(idxs[0]),
                // Ambiguous or missing simple name: fall back to the full name.
                _ => full_type_name.and_then(|full| {
                    inner.by_full_name.get(full).copied().or_else(|| {
                        self.namespace_override
                            .as_deref()
                            .and_then(|ns| inner.by_full_name.get(&override_namespace(full, ns)).copied())
                    })
                }),
            };
            idx.map(|i| inner.registrations[i].decode)
        };

        match decode_fn {
            Some(decode) => decode(body).map(Some),
            None if self.throw_on_type_not_found => Err(RegistryError::UnknownMessageType(
                full_type_name.unwrap_or(type_name).to_string(),
            )),
            None => Ok(None),
        }
    }
}

impl MessageTypeRegistry {
    /// Re-view a message as a command, when its type was registered with
    /// [`MessageTypeRegistry::register_command`].
    pub fn try_as_command(&self, message: &dyn Message) -> Option<Arc<dyn CommandMessage>> {
        let cast = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .by_type_id
                .get(&message.as_any().type_id())
                .and_then(|&i| inner.registrations[i].cast_command)
        };
        cast.and_then(|cast| cast(message))
    }
}

fn simple_name(full: &str) -> &str {
    full.rsplit("::").next().unwrap_or(full)
}

fn override_namespace(full: &str, namespace: &str) -> String {
    match full.split_once("::") {
        Some((_, rest)) => format!("{namespace}::{rest}"),
        None => format!("{namespace}::{full}"),
    }
}

fn encode_as<T>(message: &dyn Message) -> Result<JsonValue, RegistryError>
where
    T: Message + Serialize,
{
    let concrete = message
        .as_any()
        .downcast_ref::<T>()
        .ok_or(RegistryError::UnregisteredType(message.type_name()))?;
    serde_json::to_value(concrete).map_err(|source| RegistryError::Encode {
        type_name: message.type_name(),
        source,
    })
}

fn decode_as<T>(body: JsonValue) -> Result<Arc<dyn Message>, RegistryError>
where
    T: Message + DeserializeOwned,
{
    let concrete: T = serde_json::from_value(body).map_err(|source| RegistryError::Decode {
        type_name: std::any::type_name::<T>().to_string(),
        source,
    })?;
    Ok(Arc::new(concrete))
}

fn cast_command_as<T>(message: &dyn Message) -> Option<Arc<dyn CommandMessage>>
where
    T: CommandMessage + Clone,
{
    message
        .as_any()
        .downcast_ref::<T>()
        .map(|concrete| Arc::new(concrete.clone()) as Arc<dyn CommandMessage>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{CausationId, CorrelationId, MsgId};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct BaseEvent {
        id: MsgId,
    }
    crate::impl_message!(BaseEvent);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct DerivedEvent {
        id: MsgId,
        correlation_id: Option<CorrelationId>,
        causation_id: Option<CausationId>,
    }
    crate::impl_correlated_message!(DerivedEvent);

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct LeafEvent {
        id: MsgId,
    }
    crate::impl_message!(LeafEvent);

    fn registry() -> MessageTypeRegistry {
        let registry = MessageTypeRegistry::new();
        registry.register::<BaseEvent>().unwrap();
        registry.register_as::<DerivedEvent, BaseEvent>().unwrap();
        registry.register_as::<LeafEvent, DerivedEvent>().unwrap();
        registry
    }

    #[test]
    fn simple_name_lookup_returns_all_matches() {
        let registry = registry();
        let found = registry.types_by_name("DerivedEvent");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].type_id, TypeId::of::<DerivedEvent>());
        assert!(registry.types_by_name("NoSuchEvent").is_empty());
    }

    #[test]
    fn re_registration_is_idempotent() {
        let registry = registry();
        registry.register::<BaseEvent>().unwrap();
        assert_eq!(registry.types_by_name("BaseEvent").len(), 1);
    }

    #[test]
    fn ancestors_include_self_and_walk_to_root() {
        let registry = registry();
        let chain = registry.ancestors_and_self(TypeId::of::<LeafEvent>());
        assert_eq!(
            chain,
            vec![
                TypeId::of::<LeafEvent>(),
                TypeId::of::<DerivedEvent>(),
                TypeId::of::<BaseEvent>(),
            ]
        );
    }

    #[test]
    fn descendants_include_self_and_transitive_children() {
        let registry = registry();
        let set = registry.descendants_and_self(TypeId::of::<BaseEvent>());
        assert_eq!(set.len(), 3);
        assert!(set.contains(&TypeId::of::<LeafEvent>()));

        // Cached result stays correct on a second call.
        assert_eq!(registry.descendants_and_self(TypeId::of::<BaseEvent>()), set);
    }

    #[test]
    fn encode_decode_round_trip_by_simple_name() {
        let registry = registry();
        let event = BaseEvent { id: MsgId::new() };
        let encoded = registry.encode(&event).unwrap();
        assert_eq!(encoded.type_name, "BaseEvent");

        let decoded = registry
            .decode(&encoded.type_name, Some(&encoded.full_type_name), encoded.body)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.msg_id(), event.msg_id());
    }

    #[test]
    fn decode_falls_back_to_full_name() {
        let registry = registry();
        let event = LeafEvent { id: MsgId::new() };
        let encoded = registry.encode(&event).unwrap();

        let decoded = registry
            .decode("SomeRenamedEvent", Some(&encoded.full_type_name), encoded.body)
            .unwrap();
        assert!(decoded.is_some());
    }

    #[test]
    fn namespace_override_resolves_renamed_modules() {
        let registry = registry();
        let event = BaseEvent { id: MsgId::new() };
        let encoded = registry.encode(&event).unwrap();

        // Pretend the event was written by a process whose crate was renamed.
        let legacy_full = format!("legacy_crate::{}", encoded.full_type_name.split_once("::").unwrap().1);

        let lenient = MessageTypeRegistry::new();
        lenient.register::<BaseEvent>().unwrap();
        assert!(lenient.decode("???", Some(&legacy_full), encoded.body.clone()).unwrap().is_none());

        let overridden = MessageTypeRegistry::new().with_namespace_override("rill_core");
        overridden.register::<BaseEvent>().unwrap();
        assert!(overridden.decode("???", Some(&legacy_full), encoded.body).unwrap().is_some());
    }

    #[test]
    fn command_registration_allows_recast_after_decode() {
        #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
        struct DoSomething {
            id: MsgId,
            correlation_id: Option<CorrelationId>,
            causation_id: Option<CausationId>,
        }
        crate::impl_command_message!(DoSomething);

        let registry = registry();
        registry.register_command::<DoSomething>().unwrap();

        let command = DoSomething {
            id: MsgId::new(),
            correlation_id: None,
            causation_id: None,
        };
        let encoded = registry.encode(&command).unwrap();
        let decoded = registry
            .decode(&encoded.type_name, Some(&encoded.full_type_name), encoded.body)
            .unwrap()
            .unwrap();

        let recast = registry.try_as_command(decoded.as_ref()).unwrap();
        assert_eq!(recast.msg_id(), command.msg_id());

        // Plain events are not commands.
        let event = BaseEvent { id: MsgId::new() };
        assert!(registry.try_as_command(&event).is_none());
    }

    #[test]
    fn strict_registry_errors_on_unknown_type() {
        let registry = MessageTypeRegistry::new().with_throw_on_type_not_found(true);
        let err = registry
            .decode("Ghost", Some("nowhere::Ghost"), JsonValue::Null)
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownMessageType(_)));

        let err = registry.type_by_full_name("nowhere::Ghost").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownMessageType(_)));
    }
}
