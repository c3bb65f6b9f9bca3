//! Document model and validation.
//!
//! A document is an open-ended JSON object owned by a `(collection, id)` pair.
//! The store owns five reserved metadata fields that are flattened into the
//! client-visible JSON alongside the user payload:
//! `_id`, `_collection`, `_version`, `_createdAt`, `_updatedAt`.
//!
//! Invariants: `_version` is strictly monotonic per document, `_createdAt` is
//! set on first write and never changes, `_updatedAt` never decreases.

use crate::error::{DocError, Result};
use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub const FIELD_ID: &str = "_id";
pub const FIELD_COLLECTION: &str = "_collection";
pub const FIELD_VERSION: &str = "_version";
pub const FIELD_CREATED_AT: &str = "_createdAt";
pub const FIELD_UPDATED_AT: &str = "_updatedAt";

pub const RESERVED_FIELDS: [&str; 5] = [
    FIELD_ID,
    FIELD_COLLECTION,
    FIELD_VERSION,
    FIELD_CREATED_AT,
    FIELD_UPDATED_AT,
];

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub collection: String,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub payload: Map<String, Value>,
}

impl Document {
    /// Flattens the document into its client-visible JSON object.
    pub fn to_value(&self) -> Value {
        let mut out = self.payload.clone();
        out.insert(FIELD_ID.into(), Value::String(self.id.clone()));
        out.insert(FIELD_COLLECTION.into(), Value::String(self.collection.clone()));
        out.insert(FIELD_VERSION.into(), Value::from(self.version));
        out.insert(FIELD_CREATED_AT.into(), Value::from(self.created_at));
        out.insert(FIELD_UPDATED_AT.into(), Value::from(self.updated_at));
        Value::Object(out)
    }

    /// Rebuilds a document from its flattened form (the persisted shape).
    pub fn from_value(value: Value) -> Result<Document> {
        let Value::Object(mut map) = value else {
            return Err(DocError::InvalidDocument("document is not an object".into()));
        };

        let id = take_string(&mut map, FIELD_ID)?;
        let collection = take_string(&mut map, FIELD_COLLECTION)?;
        let version = take_u64(&mut map, FIELD_VERSION)?;
        let created_at = take_u64(&mut map, FIELD_CREATED_AT)?;
        let updated_at = take_u64(&mut map, FIELD_UPDATED_AT)?;

        Ok(Document {
            id,
            collection,
            version,
            created_at,
            updated_at,
            payload: map,
        })
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Document::from_value(value).map_err(D::Error::custom)
    }
}

fn take_string(map: &mut Map<String, Value>, field: &str) -> Result<String> {
    match map.remove(field) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(DocError::InvalidDocument(format!("missing field {field}"))),
    }
}

fn take_u64(map: &mut Map<String, Value>, field: &str) -> Result<u64> {
    match map.remove(field).and_then(|v| v.as_u64()) {
        Some(n) => Ok(n),
        None => Err(DocError::InvalidDocument(format!("missing field {field}"))),
    }
}

fn collection_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_]{1,50}$").unwrap())
}

fn doc_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:-]{1,100}$").unwrap())
}

pub fn validate_collection(name: &str) -> Result<()> {
    if !collection_pattern().is_match(name) {
        return Err(DocError::InvalidDocument(format!(
            "invalid collection name: {name:?}"
        )));
    }
    if name.starts_with("__") {
        return Err(DocError::InvalidDocument(format!(
            "collection name must not start with '__': {name:?}"
        )));
    }
    Ok(())
}

pub fn validate_doc_id(id: &str) -> Result<()> {
    if !doc_id_pattern().is_match(id) {
        return Err(DocError::InvalidDocument(format!(
            "invalid document id: {id:?}"
        )));
    }
    Ok(())
}

/// Removes store-owned fields from an incoming payload. Clients echoing a
/// previously read document back through PUT stay valid.
pub fn strip_reserved(payload: &mut Map<String, Value>) {
    for field in RESERVED_FIELDS {
        payload.remove(field);
    }
}

/// Size check on the serialized payload, not the flattened document.
pub fn check_payload_size(payload: &Map<String, Value>, max_bytes: usize) -> Result<()> {
    let size = serde_json::to_vec(payload)?.len();
    if size > max_bytes {
        return Err(DocError::DocumentTooLarge {
            size,
            max: max_bytes,
        });
    }
    Ok(())
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
