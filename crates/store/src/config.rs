//! Configured connection: one place that yields the store handle, the stream
//! name builder and the type registry with consistent options.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use rill_bus::BusConfig;
use rill_core::MessageTypeRegistry;

use crate::listener::StreamListener;
use crate::naming::StreamNameBuilder;
use crate::repository::{CorrelatedRepository, DEFAULT_SLICE_SIZE, StreamRepository};
use crate::store::StreamStore;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("slice size must be at least 1 (got {0})")]
    InvalidSliceSize(usize),
}

/// Recognized connection options.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Prepended to every stream name; empty means no prefix.
    pub stream_name_prefix: String,
    /// Events per read batch; must be >= 1.
    pub slice_size: usize,
    pub ack_timeout: Duration,
    pub response_timeout: Duration,
    /// Write the module-qualified type header next to the simple name.
    pub fully_qualify_type_names: bool,
    /// Unknown types on decode become errors instead of skips.
    pub throw_on_type_not_found: bool,
    /// Substituted for the leading path segment when resolving legacy full
    /// names whose originating module was renamed.
    pub namespace_override: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            stream_name_prefix: String::new(),
            slice_size: DEFAULT_SLICE_SIZE,
            ack_timeout: Duration::from_millis(500),
            response_timeout: Duration::from_secs(5),
            fully_qualify_type_names: true,
            throw_on_type_not_found: false,
            namespace_override: None,
        }
    }
}

/// A validated connection: store + namer + registry, built once and shared.
pub struct ConfiguredConnection {
    settings: ConnectionSettings,
    store: Arc<dyn StreamStore>,
    namer: StreamNameBuilder,
    registry: Arc<MessageTypeRegistry>,
}

impl core::fmt::Debug for ConfiguredConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConfiguredConnection")
            .field("settings", &self.settings)
            .field("namer", &self.namer)
            .finish()
    }
}

impl ConfiguredConnection {
    pub fn connect(
        settings: ConnectionSettings,
        store: Arc<dyn StreamStore>,
    ) -> Result<Self, ConfigError> {
        if settings.slice_size < 1 {
            return Err(ConfigError::InvalidSliceSize(settings.slice_size));
        }

        let mut registry =
            MessageTypeRegistry::new().with_throw_on_type_not_found(settings.throw_on_type_not_found);
        if let Some(ns) = &settings.namespace_override {
            registry = registry.with_namespace_override(ns.clone());
        }

        Ok(Self {
            namer: StreamNameBuilder::new(settings.stream_name_prefix.clone()),
            registry: Arc::new(registry),
            settings,
            store,
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    pub fn namer(&self) -> &StreamNameBuilder {
        &self.namer
    }

    /// Message types must be registered here before load/save/listen.
    pub fn registry(&self) -> &Arc<MessageTypeRegistry> {
        &self.registry
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            ack_timeout: self.settings.ack_timeout,
            response_timeout: self.settings.response_timeout,
        }
    }

    pub fn repository(&self) -> StreamRepository {
        StreamRepository::new(
            Arc::clone(&self.store),
            self.namer.clone(),
            Arc::clone(&self.registry),
        )
        .with_slice_size(self.settings.slice_size)
        .with_fully_qualified_type_names(self.settings.fully_qualify_type_names)
    }

    pub fn correlated_repository(&self) -> CorrelatedRepository {
        CorrelatedRepository::new(self.repository())
    }

    pub fn listener(&self, name: impl Into<String>) -> StreamListener {
        StreamListener::new(
            name,
            Arc::clone(&self.store),
            self.namer.clone(),
            Arc::clone(&self.registry),
        )
    }
}
