//! The storage contract and its adapter over pluggable backends.
//!
//! [`Storage`] is the interface application code depends on. [`StorageAdapter`]
//! implements it on top of any [`StoreBackendBuilder`]: it owns the connection
//! lifecycle, the health monitor and the upsert-merge algorithm.
//!
//! # Upsert-merge
//!
//! [`Storage::up_sert`] looks up an existing document by `_item_id`, the optional
//! `_id` and the filter (tenant scope included):
//!
//! - on a match the payload is merged field by field into that document (`$set`);
//!   `_id` and `_cat` in the payload are ignored, `_mat` is stamped
//! - without a match the payload is inserted with `_cat == _mat` and a generated
//!   `_id` when none was given
//!
//! The lookup and the write are two separate backend calls. Two concurrent upserts
//! on the same predicate may both see no match and both insert; only a uniqueness
//! constraint on `_id` in the backing store prevents duplicates. The adapter does
//! not serialize upserts.
//!
//! # Example
//!
//! ```ignore
//! use docshelf::{prelude::*, memory::InMemoryStore};
//! use bson::doc;
//!
//! let adapter = StorageAdapter::new(InMemoryStore::builder(), StorageConfig::default());
//! adapter.start().await?;
//!
//! let outcome = adapter.up_sert("items", None, &Filter::all(), doc! { "name": "test" }).await?;
//! let item = adapter.get_one("items", &Filter::from_document(&doc! { "name": "test" }), None).await?;
//!
//! adapter.stop().await;
//! ```

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bson::Document;
use mea::rwlock::RwLock;
use tracing::{debug, error, info};

use crate::{
    backend::{FindOptions, StoreBackend, StoreBackendBuilder, WriteResult},
    clock::{Clock, SystemClock},
    config::StorageConfig,
    document::{
        ID_FIELD, ITEM_ID_FIELD, MODIFIED_AT_FIELD, TENANT_FIELD, Metadata, stamp_insert, stamp_update,
    },
    error::{StorageError, StorageResult},
    health::{HealthMonitor, HealthStatus, Probe},
    query::{Expr, Filter, Predicate, Query, Sort, SortDirection},
    state::{ConnectionState, ConnectionStatus},
};

/// What a write did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Inserted,
    Updated,
    Deleted,
    /// Nothing matched and nothing was written.
    Noop,
}

/// Result of a write through the storage contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub kind: WriteKind,
    /// Number of documents inserted, updated or deleted.
    pub affected: u64,
    /// Whether the backing store acknowledged the write.
    pub acknowledged: bool,
    /// Identifier of the inserted or updated document, for single-document writes.
    pub id: Option<String>,
}

impl WriteOutcome {
    fn new(kind: WriteKind, affected: u64, id: Option<String>) -> Self {
        Self { kind, affected, acknowledged: true, id }
    }

    fn noop() -> Self {
        Self::new(WriteKind::Noop, 0, None)
    }

    pub fn is_insert(&self) -> bool {
        self.kind == WriteKind::Inserted
    }

    pub fn is_update(&self) -> bool {
        self.kind == WriteKind::Updated
    }
}

/// Uniform CRUD/query contract over a document database.
///
/// Reads that match nothing return `Ok(None)` or an empty vector. Connection
/// problems are [`StorageError::NotConnected`] or [`StorageError::ConnectionFailure`],
/// never an empty result.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns the first document matching `filter`, ordered by `query.sort`
    /// (the default sort when `query` is `None`).
    async fn get_one(
        &self,
        collection: &str,
        filter: &Filter,
        query: Option<&Query>,
    ) -> StorageResult<Option<Document>>;

    /// Returns the page of documents matching `filter` described by `query`.
    async fn get_many(
        &self,
        collection: &str,
        filter: &Filter,
        query: &Query,
    ) -> StorageResult<Vec<Document>>;

    /// Counts the documents matching `filter`.
    async fn count(&self, collection: &str, filter: &Filter) -> StorageResult<u64>;

    /// Updates the document selected by `id` and `filter`, or inserts `fields`
    /// as a new document when none matches.
    async fn up_sert(
        &self,
        collection: &str,
        id: Option<&str>,
        filter: &Filter,
        fields: Document,
    ) -> StorageResult<WriteOutcome>;

    /// Merges every entry of `fields` into all documents matching `filter`, or
    /// inserts each entry as a new document when none match.
    async fn up_sert_many(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Vec<Document>,
    ) -> StorageResult<WriteOutcome>;

    /// Removes at most one document with `_id == id`, further restricted by `filter`.
    /// Deleting a missing document succeeds with [`WriteKind::Noop`].
    async fn delete(
        &self,
        collection: &str,
        id: &str,
        filter: Option<&Filter>,
    ) -> StorageResult<WriteOutcome>;

    /// Removes every document matching `filter`.
    async fn delete_many(&self, collection: &str, filter: &Filter) -> StorageResult<WriteOutcome>;

    /// Runs `pipeline` over the documents matching `filter`. Pipeline stages are
    /// passed through to the backing store unchanged.
    async fn aggregate(
        &self,
        collection: &str,
        filter: &Filter,
        pipeline: Vec<Document>,
    ) -> StorageResult<Vec<Document>>;
}

/// The adapter's single connection handle. Replaced wholesale, never mutated.
#[derive(Debug)]
struct HandleSlot<B> {
    current: ArcSwapOption<B>,
}

impl<B> HandleSlot<B> {
    fn new() -> Self {
        Self { current: ArcSwapOption::empty() }
    }

    fn load(&self) -> StorageResult<Arc<B>> {
        self.current
            .load_full()
            .ok_or(StorageError::NotConnected)
    }

    fn replace(&self, backend: Option<Arc<B>>) -> Option<Arc<B>> {
        self.current.swap(backend)
    }
}

#[async_trait]
impl<B: StoreBackend + 'static> Probe for HandleSlot<B> {
    async fn probe(&self) -> StorageResult<()> {
        self.load()?.ping().await
    }
}

/// [`Storage`] implementation over a pluggable backend.
///
/// Construct it with a backend builder and a configuration, then call
/// [`start`](StorageAdapter::start). The adapter is `Send + Sync` and meant to be
/// shared (e.g. in an `Arc`) between concurrent callers.
#[derive(Debug)]
pub struct StorageAdapter<F: StoreBackendBuilder> {
    builder: F,
    config: StorageConfig,
    handle: Arc<HandleSlot<F::Backend>>,
    status: Arc<ConnectionStatus>,
    monitor: RwLock<Option<HealthMonitor>>,
    clock: Arc<dyn Clock>,
}

impl<F: StoreBackendBuilder> StorageAdapter<F> {
    pub fn new(builder: F, config: StorageConfig) -> Self {
        Self {
            builder,
            config,
            handle: Arc::new(HandleSlot::new()),
            status: Arc::new(ConnectionStatus::default()),
            monitor: RwLock::new(None),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the time source used for `_cat` / `_mat`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state()
    }

    /// Result of the latest health probe.
    pub fn is_available(&self) -> bool {
        self.status.is_available()
    }

    /// Snapshot of the health monitor, `None` when it is not running.
    pub async fn health(&self) -> Option<HealthStatus> {
        match self.monitor.read().await.as_ref() {
            Some(monitor) => Some(monitor.status().await),
            None => None,
        }
    }

    /// Opens the connection and starts the health monitor.
    ///
    /// Connection failures are logged and leave the adapter
    /// [`Unavailable`](ConnectionState::Unavailable); they are not returned.
    /// Invalid configuration is returned as [`StorageError::Configuration`].
    /// Calling `start` again reconnects and replaces the previous handle.
    pub async fn start(&self) -> StorageResult<()> {
        info!(
            address = %self.config.address(),
            database = %self.config.database,
            "Storage adapter starting"
        );

        self.config.validate()?;

        let previous = self.monitor.write().await.take();
        if let Some(mut previous) = previous {
            previous.stop().await;
        }

        self.status.set_state(ConnectionState::Connecting);

        let connected = match tokio::time::timeout(
            self.config.connect_timeout,
            self.builder.build(&self.config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StorageError::ConnectionFailure(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            ))),
        };

        match connected {
            Ok(backend) => {
                if let Some(stale) = self.handle.replace(Some(Arc::new(backend))) {
                    Self::close(stale).await;
                }
                self.status.set_state(ConnectionState::Connected);
                self.status.set_state(ConnectionState::Validating);

                let mut health = HealthMonitor::new(
                    self.status.clone(),
                    self.config.health_interval,
                    self.config.probe_timeout,
                );
                health.start(self.handle.clone());

                let replaced = self.monitor.write().await.replace(health);
                if let Some(mut replaced) = replaced {
                    replaced.stop().await;
                }

                info!("Storage adapter started");
            }
            Err(e) => {
                if let Some(stale) = self.handle.replace(None) {
                    Self::close(stale).await;
                }
                self.status.set_state(ConnectionState::Unavailable);

                error!(
                    error = %e,
                    error_detail = ?e,
                    address = %self.config.address(),
                    database = %self.config.database,
                    "Storage connection failed"
                );
            }
        }

        Ok(())
    }

    /// Stops the health monitor and closes the connection handle.
    ///
    /// The handle is closed exactly once; later operations fail with
    /// [`StorageError::NotConnected`].
    pub async fn stop(&self) {
        info!("Storage adapter stopping");

        if let Some(mut monitor) = self.monitor.write().await.take() {
            monitor.stop().await;
        }

        self.status.set_state(ConnectionState::Disconnected);

        if let Some(handle) = self.handle.replace(None) {
            Self::close(handle).await;
        }

        info!("Storage adapter stopped");
    }

    /// Runs one health probe now and records its result.
    pub async fn validate_connection(&self) -> bool {
        let status = RwLock::new(HealthStatus::default());
        HealthMonitor::check(
            self.handle.as_ref(),
            &self.status,
            &status,
            self.config.probe_timeout,
        )
        .await
    }

    async fn close(handle: Arc<F::Backend>) {
        if let Err(e) = handle.close().await {
            error!(error = %e, "Failed to close storage connection");
        }
    }

    fn connection(&self) -> StorageResult<Arc<F::Backend>> {
        self.handle.load()
    }

    /// Read options with `_id` appended as a final tie-breaker.
    fn find_options(query: &Query, skip: usize, limit: usize) -> FindOptions {
        let mut sort = query.sort.clone();
        if !sort.iter().any(|s| s.field == ID_FIELD) {
            sort.push(Sort::new(ID_FIELD, SortDirection::Asc));
        }

        FindOptions { sort, skip, limit: Some(limit) }
    }

    fn acknowledged(result: WriteResult, collection: &str) -> StorageResult<WriteResult> {
        if result.acknowledged {
            Ok(result)
        } else {
            Err(StorageError::WriteFailure(format!(
                "write to collection {collection} was not acknowledged"
            )))
        }
    }

    /// Tags a new document with the filter's tenant scope: one tenant as a
    /// string, several as an array. A payload's own `_tenant` is kept.
    fn attach_tenant(document: &mut Document, filter: &Filter) {
        if document.contains_key(TENANT_FIELD) {
            return;
        }

        match filter.tenants() {
            Some([tenant]) => {
                document.insert(TENANT_FIELD, tenant.clone());
            },
            Some(tenants) if !tenants.is_empty() => {
                document.insert(TENANT_FIELD, tenants.to_vec());
            },
            _ => {},
        }
    }

    async fn insert(
        &self,
        backend: &F::Backend,
        collection: &str,
        id: Option<&str>,
        filter: &Filter,
        mut fields: Document,
    ) -> StorageResult<WriteOutcome> {
        Self::attach_tenant(&mut fields, filter);
        let id = stamp_insert(&mut fields, id, collection, self.clock.now());

        let result = backend
            .insert_one(collection, fields)
            .await?;
        Self::acknowledged(result, collection)?;

        Ok(WriteOutcome::new(WriteKind::Inserted, result.inserted.max(1), Some(id)))
    }
}

#[async_trait]
impl<F: StoreBackendBuilder> Storage for StorageAdapter<F> {
    async fn get_one(
        &self,
        collection: &str,
        filter: &Filter,
        query: Option<&Query>,
    ) -> StorageResult<Option<Document>> {
        let backend = self.connection()?;
        let default_query = Query::default();
        let query = query.unwrap_or(&default_query);
        query.validate()?;

        let found = backend
            .find(collection, filter.resolve().as_ref(), Self::find_options(query, 0, 1))
            .await?;

        Ok(found.into_iter().next())
    }

    async fn get_many(
        &self,
        collection: &str,
        filter: &Filter,
        query: &Query,
    ) -> StorageResult<Vec<Document>> {
        let backend = self.connection()?;
        query.validate()?;

        backend
            .find(
                collection,
                filter.resolve().as_ref(),
                Self::find_options(query, query.offset, query.limit),
            )
            .await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> StorageResult<u64> {
        self.connection()?
            .count(collection, filter.resolve().as_ref())
            .await
    }

    async fn up_sert(
        &self,
        collection: &str,
        id: Option<&str>,
        filter: &Filter,
        fields: Document,
    ) -> StorageResult<WriteOutcome> {
        let backend = self.connection()?;

        if id.is_none() && filter.predicate().is_none() {
            let outcome = self.insert(&backend, collection, None, filter, fields).await?;
            debug!(collection, id = ?outcome.id, "Upsert inserted unconditionally");
            return Ok(outcome);
        }

        let mut conditions = vec![Predicate::eq(ITEM_ID_FIELD, collection)];
        if let Some(id) = id {
            conditions.push(Predicate::eq(ID_FIELD, id));
        }
        let lookup = filter
            .resolve_with(conditions)
            .unwrap_or_else(|| Predicate::eq(ITEM_ID_FIELD, collection));

        let existing = backend
            .find(
                collection,
                Some(&lookup),
                Self::find_options(&Query::default(), 0, 1),
            )
            .await?
            .into_iter()
            .next();

        let Some(existing) = existing else {
            let outcome = self.insert(&backend, collection, id, filter, fields).await?;
            debug!(collection, id = ?outcome.id, "Upsert inserted");
            return Ok(outcome);
        };

        let existing_id = existing
            .get(ID_FIELD)
            .cloned()
            .ok_or_else(|| StorageError::InvalidDocument(format!(
                "stored document in {collection} has no {ID_FIELD}"
            )))?;
        let previous = Metadata::read(&existing);

        let mut set = fields;
        stamp_update(&mut set, collection, self.clock.now(), previous.modified_at);

        let result = backend
            .update_one(collection, &Predicate::eq(ID_FIELD, existing_id), set)
            .await?;
        let result = Self::acknowledged(result, collection)?;

        debug!(collection, id = ?previous.id, matched = result.matched, "Upsert updated");

        Ok(WriteOutcome::new(WriteKind::Updated, result.matched, previous.id))
    }

    async fn up_sert_many(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Vec<Document>,
    ) -> StorageResult<WriteOutcome> {
        let backend = self.connection()?;

        if fields.is_empty() {
            return Ok(WriteOutcome::noop());
        }

        let lookup = filter
            .resolve_with([Predicate::eq(ITEM_ID_FIELD, collection)])
            .unwrap_or_else(|| Predicate::eq(ITEM_ID_FIELD, collection));
        // The most recently modified match bounds the new `_mat` from below.
        let latest = backend
            .find(
                collection,
                Some(&lookup),
                FindOptions {
                    sort: vec![Sort::new(MODIFIED_AT_FIELD, SortDirection::Desc)],
                    skip: 0,
                    limit: Some(1),
                },
            )
            .await?
            .into_iter()
            .next();

        if let Some(latest) = latest {
            // Later entries win on overlapping fields, as if applied in order.
            let mut set = fields
                .into_iter()
                .fold(Document::new(), |mut merged, entry| {
                    for (field, value) in entry {
                        merged.insert(field, value);
                    }
                    merged
                });
            stamp_update(&mut set, collection, self.clock.now(), Metadata::read(&latest).modified_at);

            let result = backend
                .update_many(collection, Some(&lookup), set)
                .await?;
            let result = Self::acknowledged(result, collection)?;

            debug!(collection, matched = result.matched, "Batch upsert updated");

            return Ok(WriteOutcome::new(WriteKind::Updated, result.matched, None));
        }

        let now = self.clock.now();
        let documents = fields
            .into_iter()
            .map(|mut entry| {
                Self::attach_tenant(&mut entry, filter);
                stamp_insert(&mut entry, None, collection, now);
                entry
            })
            .collect::<Vec<_>>();

        let result = match backend.insert_many(collection, documents).await {
            Ok(result) => Self::acknowledged(result, collection)?,
            Err(e @ StorageError::PartialWrite { .. }) => {
                error!(collection, error = %e, "Batch upsert stopped part way");
                return Err(e);
            },
            Err(e) => return Err(e),
        };

        debug!(collection, inserted = result.inserted, "Batch upsert inserted");

        Ok(WriteOutcome::new(WriteKind::Inserted, result.inserted, None))
    }

    async fn delete(
        &self,
        collection: &str,
        id: &str,
        filter: Option<&Filter>,
    ) -> StorageResult<WriteOutcome> {
        let backend = self.connection()?;

        let by_id = Predicate::eq(ID_FIELD, id);
        let lookup = match filter {
            Some(filter) => filter
                .resolve_with([by_id.clone()])
                .unwrap_or(by_id),
            None => by_id,
        };

        let result = backend
            .delete_one(collection, &lookup)
            .await?;
        let result = Self::acknowledged(result, collection)?;

        debug!(collection, id, deleted = result.deleted, "Delete");

        Ok(match result.deleted {
            0 => WriteOutcome::noop(),
            n => WriteOutcome::new(WriteKind::Deleted, n, Some(id.to_string())),
        })
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> StorageResult<WriteOutcome> {
        let backend = self.connection()?;

        let result = backend
            .delete_many(collection, filter.resolve().as_ref())
            .await?;
        let result = Self::acknowledged(result, collection)?;

        debug!(collection, deleted = result.deleted, "Delete many");

        Ok(match result.deleted {
            0 => WriteOutcome::noop(),
            n => WriteOutcome::new(WriteKind::Deleted, n, None),
        })
    }

    async fn aggregate(
        &self,
        collection: &str,
        filter: &Filter,
        pipeline: Vec<Document>,
    ) -> StorageResult<Vec<Document>> {
        let scope: Option<Expr> = filter.resolve();

        self.connection()?
            .aggregate(collection, scope.as_ref(), pipeline)
            .await
    }
}
