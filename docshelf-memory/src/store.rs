//! In-memory storage implementation for the storage adapter.
//!
//! This module provides a simple backend that stores documents as BSON documents
//! in HashMaps behind async-safe read-write locks. Every handle opened by
//! [`InMemoryStoreBuilder`] shares the same data, so reconnecting keeps what was
//! written before.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use async_trait::async_trait;
use mea::rwlock::RwLock;
use bson::{Bson, Document};
use tracing::debug;

use docshelf_core::{
    backend::{FindOptions, StoreBackend, StoreBackendBuilder, WriteResult},
    config::StorageConfig,
    document::{ID_FIELD, id_string},
    error::{StorageError, StorageResult},
    query::{Expr, Filter, Sort, SortDirection},
};

use crate::evaluator::{DocumentEvaluator, compare_documents};

type CollectionMap = HashMap<String, Document>;
type StoreMap = HashMap<String, CollectionMap>;


/// Thread-safe in-memory document storage backend.
///
/// # Thread Safety
///
/// `InMemoryStore` is cloneable and uses `Arc`-wrapped internal state, allowing
/// it to be safely shared across async tasks. Clones share the same data and the
/// same reachability switch.
///
/// # Reachability
///
/// [`set_reachable(false)`](InMemoryStore::set_reachable) makes every operation,
/// `ping` and new connections fail with [`StorageError::ConnectionFailure`], which
/// stands in for a database server going away.
///
/// # Performance
///
/// Queries scan all documents in a collection (no indexing). For small to medium
/// datasets this is typically acceptable. For larger datasets, use a persistent
/// backend like MongoDB.
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    /// The main storage map: collection_name -> (document_id -> document)
    store: Arc<RwLock<StoreMap>>,
    reachable: Arc<AtomicBool>,
    /// Per-handle flag set by `close`.
    closed: Arc<AtomicBool>,
    /// Number of handles closed so far, shared by all handles.
    closes: Arc<AtomicUsize>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(StoreMap::new())),
            reachable: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicBool::new(false)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a builder that opens handles onto a fresh, empty store.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use docshelf_memory::InMemoryStore;
    ///
    /// let builder = InMemoryStore::builder();
    /// let store = builder.store().clone();
    /// let adapter = StorageAdapter::new(builder, StorageConfig::default());
    /// ```
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::new(Self::new())
    }

    /// Opens a new handle sharing this store's data.
    pub fn handle(&self) -> Self {
        Self {
            store: self.store.clone(),
            reachable: self.reachable.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            closes: self.closes.clone(),
        }
    }

    /// Simulates the server becoming reachable or unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Number of handles closed over the store's lifetime.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Snapshot of every document in `collection`, in no particular order.
    pub async fn dump(&self, collection: &str) -> Vec<Document> {
        self.store
            .read()
            .await
            .get(collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default()
    }

    fn check(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionFailure("connection is closed".to_string()));
        }
        if !self.is_reachable() {
            return Err(StorageError::ConnectionFailure("server is unreachable".to_string()));
        }

        Ok(())
    }

    fn matching<'a>(
        collection_map: &'a CollectionMap,
        filter: Option<&Expr>,
    ) -> StorageResult<Vec<&'a Document>> {
        let mut matched = Vec::new();

        for document in collection_map.values() {
            if DocumentEvaluator::matches(document, filter)? {
                matched.push(document);
            }
        }

        Ok(matched)
    }

    /// Keys of matching documents, in `_id` order so "first match" is stable.
    fn matching_keys(collection_map: &CollectionMap, filter: Option<&Expr>) -> StorageResult<Vec<String>> {
        let mut keys = Self::matching(collection_map, filter)?
            .into_iter()
            .filter_map(|document| document.get(ID_FIELD).and_then(id_string))
            .collect::<Vec<_>>();
        keys.sort();

        Ok(keys)
    }

    fn apply_set(document: &mut Document, set: &Document) {
        for (field, value) in set {
            if field != ID_FIELD {
                document.insert(field.clone(), value.clone());
            }
        }
    }

    fn sorted(mut documents: Vec<Document>, sort: &[Sort]) -> Vec<Document> {
        if !sort.is_empty() {
            documents.sort_by(|a, b| compare_documents(a, b, sort));
        }
        documents
    }

    fn run_stage(documents: Vec<Document>, stage: &Document) -> StorageResult<Vec<Document>> {
        let Some((name, spec)) = stage.iter().next() else {
            return Err(StorageError::InvalidQuery("empty aggregation stage".to_string()));
        };
        if stage.len() != 1 {
            return Err(StorageError::InvalidQuery(format!(
                "aggregation stage must have exactly one operator, found {}",
                stage.len()
            )));
        }

        match (name.as_str(), spec) {
            ("$match", Bson::Document(spec)) => {
                let filter = Filter::from_document(spec);
                let mut matched = Vec::with_capacity(documents.len());
                for document in documents {
                    if DocumentEvaluator::matches(&document, filter.predicate())? {
                        matched.push(document);
                    }
                }
                Ok(matched)
            },
            ("$sort", Bson::Document(spec)) => {
                let sort = spec
                    .iter()
                    .map(|(field, direction)| {
                        SortDirection::from_bson(direction)
                            .map(|direction| Sort::new(field.clone(), direction))
                            .ok_or_else(|| StorageError::InvalidQuery(format!(
                                "invalid $sort direction for {field}: {direction}"
                            )))
                    })
                    .collect::<StorageResult<Vec<_>>>()?;
                Ok(Self::sorted(documents, &sort))
            },
            ("$skip", value) => Ok(documents.into_iter().skip(stage_count(name, value)?).collect()),
            ("$limit", value) => Ok(documents.into_iter().take(stage_count(name, value)?).collect()),
            ("$count", Bson::String(field)) => {
                let mut result = Document::new();
                result.insert(field.clone(), documents.len() as i64);
                Ok(vec![result])
            },
            (other, _) => Err(StorageError::Backend(format!(
                "aggregation stage {other} is not supported by the in-memory store"
            ))),
        }
    }
}

fn stage_count(stage: &str, value: &Bson) -> StorageResult<usize> {
    let count = match value {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        other => return Err(StorageError::InvalidQuery(format!("{stage} expects an integer, found {other}"))),
    };

    usize::try_from(count)
        .map_err(|_| StorageError::InvalidQuery(format!("{stage} must not be negative")))
}


#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn find(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        options: FindOptions,
    ) -> StorageResult<Vec<Document>> {
        self.check()?;

        let store = self.store.read().await;
        let collection_map = match store.get(collection) {
            Some(col) => col,
            None => return Ok(vec![]),
        };

        let matched = Self::matching(collection_map, filter)?
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();

        Ok(
            Self::sorted(matched, &options.sort)
                .into_iter()
                .skip(options.skip)
                .take(options.limit.unwrap_or(usize::MAX))
                .collect()
        )
    }

    async fn count(&self, collection: &str, filter: Option<&Expr>) -> StorageResult<u64> {
        self.check()?;

        let store = self.store.read().await;
        match store.get(collection) {
            Some(collection_map) => Ok(Self::matching(collection_map, filter)?.len() as u64),
            None => Ok(0),
        }
    }

    async fn insert_one(&self, collection: &str, document: Document) -> StorageResult<WriteResult> {
        self.insert_many(collection, vec![document]).await
    }

    /// Ordered batch insert: documents are written in turn until the first
    /// failure. A failure after at least one write is a
    /// [`StorageError::PartialWrite`] carrying the number already written.
    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> StorageResult<WriteResult> {
        self.check()?;

        let mut store = self.store.write().await;
        let collection_map = store
            .entry(collection.to_string())
            .or_default();

        let mut inserted = 0u64;
        for document in documents {
            let written = match document.get(ID_FIELD).and_then(id_string) {
                None => Err(StorageError::InvalidDocument(format!("document has no {ID_FIELD}"))),
                Some(key) if collection_map.contains_key(&key) => {
                    Err(StorageError::DuplicateKey(key, collection.to_string()))
                },
                Some(key) => {
                    collection_map.insert(key, document);
                    Ok(())
                },
            };

            match written {
                Ok(()) => inserted += 1,
                Err(e) if inserted == 0 => return Err(e),
                Err(e) => return Err(StorageError::PartialWrite { affected: inserted, source: Box::new(e) }),
            }
        }

        debug!(collection, inserted, "Inserted documents");

        Ok(WriteResult::inserted(inserted))
    }

    async fn update_one(&self, collection: &str, filter: &Expr, set: Document) -> StorageResult<WriteResult> {
        self.check()?;

        let mut store = self.store.write().await;
        let Some(collection_map) = store.get_mut(collection) else {
            return Ok(WriteResult::updated(0, 0));
        };

        let key = Self::matching_keys(collection_map, Some(filter))?
            .into_iter()
            .next();

        match key.and_then(|key| collection_map.get_mut(&key)) {
            Some(document) => {
                Self::apply_set(document, &set);
                Ok(WriteResult::updated(1, 1))
            },
            None => Ok(WriteResult::updated(0, 0)),
        }
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        set: Document,
    ) -> StorageResult<WriteResult> {
        self.check()?;

        let mut store = self.store.write().await;
        let Some(collection_map) = store.get_mut(collection) else {
            return Ok(WriteResult::updated(0, 0));
        };

        let keys = Self::matching_keys(collection_map, filter)?;
        for key in &keys {
            if let Some(document) = collection_map.get_mut(key) {
                Self::apply_set(document, &set);
            }
        }

        let matched = keys.len() as u64;
        Ok(WriteResult::updated(matched, matched))
    }

    async fn delete_one(&self, collection: &str, filter: &Expr) -> StorageResult<WriteResult> {
        self.check()?;

        let mut store = self.store.write().await;
        let Some(collection_map) = store.get_mut(collection) else {
            return Ok(WriteResult::deleted(0));
        };

        let removed = Self::matching_keys(collection_map, Some(filter))?
            .into_iter()
            .next()
            .and_then(|key| collection_map.remove(&key));

        Ok(WriteResult::deleted(removed.map_or(0, |_| 1)))
    }

    async fn delete_many(&self, collection: &str, filter: Option<&Expr>) -> StorageResult<WriteResult> {
        self.check()?;

        let mut store = self.store.write().await;
        let Some(collection_map) = store.get_mut(collection) else {
            return Ok(WriteResult::deleted(0));
        };

        let keys = Self::matching_keys(collection_map, filter)?;
        for key in &keys {
            collection_map.remove(key);
        }

        Ok(WriteResult::deleted(keys.len() as u64))
    }

    async fn aggregate(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        pipeline: Vec<Document>,
    ) -> StorageResult<Vec<Document>> {
        self.check()?;

        let mut documents = {
            let store = self.store.read().await;
            match store.get(collection) {
                Some(collection_map) => Self::matching(collection_map, filter)?
                    .into_iter()
                    .cloned()
                    .collect::<Vec<_>>(),
                None => vec![],
            }
        };

        for stage in &pipeline {
            documents = Self::run_stage(documents, stage)?;
        }

        Ok(documents)
    }

    async fn ping(&self) -> StorageResult<()> {
        self.check()
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            debug!("In-memory store handle closed");
        }

        Ok(())
    }
}


/// Builder opening [`InMemoryStore`] handles for a
/// [`StorageAdapter`](docshelf_core::adapter::StorageAdapter).
///
/// The configuration is accepted but not used: there is no server to address.
/// Building fails with [`StorageError::ConnectionFailure`] while the store is
/// unreachable.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStoreBuilder {
    store: InMemoryStore,
}

impl InMemoryStoreBuilder {
    pub fn new(store: InMemoryStore) -> Self {
        Self { store }
    }

    /// The store handles are opened onto.
    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }
}

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    async fn build(&self, config: &StorageConfig) -> StorageResult<Self::Backend> {
        if !self.store.is_reachable() {
            return Err(StorageError::ConnectionFailure(format!(
                "cannot reach {}",
                config.address()
            )));
        }

        debug!(database = %config.database, "Opening in-memory store handle");

        Ok(self.store.handle())
    }
}
