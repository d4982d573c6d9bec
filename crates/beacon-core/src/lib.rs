//! Core domain model for beacon-sync: conversations, beacon field sets, field mappings and ledger entries.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "beacon-core";

pub const NOTE_THREAD_TYPE: &str = "note";
pub const EMBED_FORM_SOURCE_TYPE: &str = "embed-form";

/// Opaque conversation identifier. The API sends numbers; strings are accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for ConversationId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for ConversationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Number(u64),
            Text(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Number(n) => Self(n.to_string()),
            RawId::Text(s) => Self(s),
        })
    }
}

/// Search result row; only the id is needed to load the full record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default)]
    pub number: Option<u64>,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub threads: Option<Vec<Thread>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Thread {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub source: Option<ThreadSource>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ThreadSource {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub via: Option<String>,
}

impl Thread {
    /// A note posted by the embedded support widget's form.
    pub fn is_beacon_note(&self) -> bool {
        self.kind.as_deref() == Some(NOTE_THREAD_TYPE)
            && self
                .source
                .as_ref()
                .and_then(|s| s.kind.as_deref())
                == Some(EMBED_FORM_SOURCE_TYPE)
    }
}

/// Ordered name/value pairs lifted from a beacon note.
///
/// Iteration follows first-insertion order. Inserting a name that already
/// exists replaces its value without moving it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BeaconFieldSet {
    fields: Vec<(String, String)>,
}

impl BeaconFieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(existing) => existing.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for BeaconFieldSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (name, value) in iter {
            set.insert(name, value);
        }
        set
    }
}

/// A field set bound to the conversation it was extracted from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconExtraction {
    pub conversation_id: ConversationId,
    pub fields: BeaconFieldSet,
}

/// Field name to custom-field id, configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping {
    ids: BTreeMap<String, u64>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, field_id: u64) {
        self.ids.insert(name.into(), field_id);
    }

    pub fn field_id(&self, name: &str) -> Option<u64> {
        self.ids.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for FieldMapping {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldValue {
    #[serde(rename = "fieldId")]
    pub field_id: u64,
    pub value: String,
}

/// Body of a conversation update that overwrites custom fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldsUpdate {
    #[serde(rename = "customFields")]
    pub custom_fields: Vec<CustomFieldValue>,
}

impl CustomFieldsUpdate {
    /// Keeps mapped names only, in field-set order.
    pub fn from_fields(fields: &BeaconFieldSet, mapping: &FieldMapping) -> Self {
        let custom_fields = fields
            .iter()
            .filter_map(|(name, value)| {
                mapping.field_id(name).map(|field_id| CustomFieldValue {
                    field_id,
                    value: value.to_string(),
                })
            })
            .collect();
        Self { custom_fields }
    }
}

/// Durable record that a conversation has been synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub conversation_id: ConversationId,
    pub payload_sent: String,
    pub updated_on: DateTime<Utc>,
}
