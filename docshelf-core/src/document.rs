//! Document metadata and serialization helpers.
//!
//! Documents are plain [`bson::Document`] maps. Every persisted document carries the
//! metadata fields named by the constants in this module; [`Metadata`] reads them back
//! and the `stamp_*` functions write them.

use bson::{Bson, DateTime, Document, de::deserialize_from_document, ser::serialize_to_document};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;

/// Unique identifier of the document.
pub const ID_FIELD: &str = "_id";
/// Identifier of the logical item type the document belongs to.
pub const ITEM_ID_FIELD: &str = "_item_id";
/// Creation timestamp, set once at insertion.
pub const CREATED_AT_FIELD: &str = "_cat";
/// Modification timestamp, updated on every mutation.
pub const MODIFIED_AT_FIELD: &str = "_mat";
/// Tenant identifier(s), a string or an array of strings.
pub const TENANT_FIELD: &str = "_tenant";

/// Generates a new document identifier (a UUID v4 string).
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Metadata fields read from a stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub id: Option<String>,
    pub item_id: Option<String>,
    pub created_at: Option<DateTime>,
    pub modified_at: Option<DateTime>,
}

impl Metadata {
    pub fn read(document: &Document) -> Self {
        Self {
            id: document.get(ID_FIELD).and_then(id_string),
            item_id: document.get_str(ITEM_ID_FIELD).ok().map(str::to_string),
            created_at: document.get_datetime(CREATED_AT_FIELD).ok().copied(),
            modified_at: document.get_datetime(MODIFIED_AT_FIELD).ok().copied(),
        }
    }
}

/// Returns a string form of an `_id` value, if it has one.
pub fn id_string(value: &Bson) -> Option<String> {
    match value {
        Bson::String(s) => Some(s.clone()),
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        _ => None,
    }
}

/// Stamps a document that is about to be inserted.
///
/// `_cat` and `_mat` receive the same instant. `_id` is `id` if given, else the
/// payload's own `_id`, else a generated UUID. Returns the identifier used.
pub fn stamp_insert(
    document: &mut Document,
    id: Option<&str>,
    item_id: &str,
    now: DateTime,
) -> String {
    let id = id
        .map(str::to_string)
        .or_else(|| document.get(ID_FIELD).and_then(id_string))
        .unwrap_or_else(generate_id);

    document.insert(ID_FIELD, id.clone());
    document.insert(ITEM_ID_FIELD, item_id);
    document.insert(CREATED_AT_FIELD, now);
    document.insert(MODIFIED_AT_FIELD, now);

    id
}

/// Prepares an update payload for a `$set` merge.
///
/// `_id` and `_cat` are stripped so callers cannot overwrite them, `_item_id`
/// is forced and `_mat` is stamped. `previous` is the stored `_mat`; the new
/// value is always strictly later.
pub fn stamp_update(
    document: &mut Document,
    item_id: &str,
    now: DateTime,
    previous: Option<DateTime>,
) -> DateTime {
    document.remove(ID_FIELD);
    document.remove(CREATED_AT_FIELD);

    let modified_at = match previous {
        Some(previous) if now <= previous => {
            DateTime::from_millis(previous.timestamp_millis() + 1)
        }
        _ => now,
    };

    document.insert(ITEM_ID_FIELD, item_id);
    document.insert(MODIFIED_AT_FIELD, modified_at);

    modified_at
}

/// Converts any serializable value into a document.
pub fn to_document<T: Serialize>(value: &T) -> StorageResult<Document> {
    Ok(serialize_to_document(value)?)
}

/// Converts a document into a deserializable value, ignoring metadata fields
/// the target type does not declare.
pub fn from_document<T: for<'de> Deserialize<'de>>(document: Document) -> StorageResult<T> {
    Ok(deserialize_from_document(document)?)
}

/// Removes the metadata fields from a document.
pub fn strip_metadata(mut document: Document) -> Document {
    for field in [ID_FIELD, ITEM_ID_FIELD, CREATED_AT_FIELD, MODIFIED_AT_FIELD] {
        document.remove(field);
    }
    document
}
