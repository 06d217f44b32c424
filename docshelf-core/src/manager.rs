//! Key/value view over a [`Storage`].
//!
//! A [`Manager`] narrows the storage contract to single-key access for one item
//! type: the collection is named by `type_id` and the key is the document `_id`.

use std::sync::Arc;

use bson::Document;
use serde::{Deserialize, Serialize};

use crate::{
    adapter::{Storage, WriteOutcome},
    document::{ID_FIELD, Metadata, from_document, strip_metadata, to_document},
    error::StorageResult,
    query::{Filter, Predicate, Query, SortDirection},
};

/// Page size used when walking a whole collection.
const SCAN_PAGE: usize = 500;

#[derive(Debug)]
pub struct Manager<S: Storage + ?Sized> {
    storage: Arc<S>,
    type_id: String,
}

impl<S: Storage + ?Sized> Clone for Manager<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            type_id: self.type_id.clone(),
        }
    }
}

impl<S: Storage + ?Sized> Manager<S> {
    pub fn new(storage: Arc<S>, type_id: impl Into<String>) -> Self {
        Self { storage, type_id: type_id.into() }
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    fn by_key(key: &str) -> Filter {
        Filter::new(Predicate::eq(ID_FIELD, key))
    }

    /// Returns the stored document for `key`, metadata included.
    pub async fn get(&self, key: &str) -> StorageResult<Option<Document>> {
        self.storage
            .get_one(&self.type_id, &Self::by_key(key), None)
            .await
    }

    /// Returns the value for `key` converted into `T`.
    pub async fn get_as<T>(&self, key: &str) -> StorageResult<Option<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.get(key)
            .await?
            .map(|document| from_document(strip_metadata(document)))
            .transpose()
    }

    /// Upserts `value` under `key`; existing fields not in `value` are kept.
    pub async fn set(&self, key: &str, value: Document) -> StorageResult<WriteOutcome> {
        self.storage
            .up_sert(&self.type_id, Some(key), &Filter::all(), value)
            .await
    }

    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T) -> StorageResult<WriteOutcome> {
        self.set(key, to_document(value)?).await
    }

    pub async fn delete(&self, key: &str) -> StorageResult<WriteOutcome> {
        self.storage
            .delete(&self.type_id, key, None)
            .await
    }

    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self
            .storage
            .count(&self.type_id, &Self::by_key(key))
            .await?
            > 0)
    }

    /// All keys, in ascending order.
    pub async fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .items()
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// All stored documents, in ascending key order.
    pub async fn values(&self) -> StorageResult<Vec<Document>> {
        Ok(self
            .items()
            .await?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    /// All `(key, document)` pairs, in ascending key order.
    pub async fn items(&self) -> StorageResult<Vec<(String, Document)>> {
        let mut items = Vec::new();
        let mut offset = 0;

        loop {
            let query = Query::builder()
                .sort(ID_FIELD, SortDirection::Asc)
                .offset(offset)
                .limit(SCAN_PAGE)
                .build();
            let page = self
                .storage
                .get_many(&self.type_id, &Filter::all(), &query)
                .await?;
            let fetched = page.len();

            items.extend(page.into_iter().filter_map(|document| {
                Metadata::read(&document)
                    .id
                    .map(|key| (key, document))
            }));

            if fetched < SCAN_PAGE {
                break;
            }
            offset += fetched;
        }

        Ok(items)
    }
}
