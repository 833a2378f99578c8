//! Typed metadata attached to events before persistence.
//!
//! Metadata rides next to the event payload as a separate JSON object and is
//! restored on deserialization. Entries are keyed by a stable name; two
//! standard entries cover the type headers and the audit trail, and callers
//! may add their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// One entry in the bag, implemented by any serde-able struct with a stable
/// name.
pub trait MetadatumEntry: Serialize {
    const NAME: &'static str;
}

/// Type headers written with every persisted event.
///
/// `event_full_type_name` is the legacy qualified name; readers must keep
/// accepting it even though resolution prefers the simple name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonMetadata {
    pub event_name: String,
    pub event_full_type_name: String,
}

impl MetadatumEntry for CommonMetadata {
    const NAME: &'static str = "common";
}

/// Who caused the event and when it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub policy_user_id: Option<Uuid>,
    pub event_date_utc: DateTime<Utc>,
}

impl MetadatumEntry for AuditRecord {
    const NAME: &'static str = "audit";
}

/// Bag of named JSON entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: serde_json::Map<String, JsonValue>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a typed entry, replacing any previous entry with the same name.
    pub fn set<E: MetadatumEntry>(&mut self, entry: &E) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(entry)?;
        self.entries.insert(E::NAME.to_string(), value);
        Ok(())
    }

    /// Insert a raw entry under a caller-chosen name.
    pub fn set_raw(&mut self, name: impl Into<String>, value: JsonValue) {
        self.entries.insert(name.into(), value);
    }

    /// Read a typed entry back, if present and well-formed.
    pub fn get<E: MetadatumEntry + serde::de::DeserializeOwned>(&self) -> Option<E> {
        self.entries
            .get(E::NAME)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_raw(&self, name: &str) -> Option<&JsonValue> {
        self.entries.get(name)
    }

    /// Merge another bag into this one; colliding names take the other's value.
    pub fn merge(&mut self, other: &Metadata) {
        for (k, v) in &other.entries {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_value(&self) -> JsonValue {
        JsonValue::Object(self.entries.clone())
    }

    pub fn from_value(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(entries) => Self { entries },
            _ => Self::default(),
        }
    }
}
