//! Storage backend abstraction for the storage adapter.
//!
//! This module defines the driver-level seam between [`StorageAdapter`](crate::adapter::StorageAdapter)
//! and a concrete document database. A backend value is one live connection handle;
//! a [`StoreBackendBuilder`] opens such a handle from a [`StorageConfig`].
//!
//! # Traits
//!
//! - [`StoreBackend`]: operations against one connection (find, count, writes, aggregate, ping)
//! - [`StoreBackendBuilder`]: factory opening a backend from configuration
//!
//! Backends receive predicates as [`Expr`] trees and translate them with a
//! [`QueryVisitor`](crate::query::QueryVisitor) into their native form.

use async_trait::async_trait;
use bson::Document;
use std::fmt::Debug;

use crate::{
    config::StorageConfig,
    error::StorageResult,
    query::{Expr, Sort},
};

/// Read options passed down to a backend so pagination happens server-side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Sort keys, applied in order.
    pub sort: Vec<Sort>,
    /// Number of documents to skip.
    pub skip: usize,
    /// Maximum number of documents to return, unbounded when `None`.
    pub limit: Option<usize>,
}

/// Driver-level result of a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Whether the backing store acknowledged the write.
    pub acknowledged: bool,
    /// Documents matched by an update filter.
    pub matched: u64,
    /// Documents changed by an update.
    pub modified: u64,
    /// Documents inserted.
    pub inserted: u64,
    /// Documents deleted.
    pub deleted: u64,
}

impl WriteResult {
    pub fn inserted(count: u64) -> Self {
        Self { acknowledged: true, inserted: count, ..Self::default() }
    }

    pub fn updated(matched: u64, modified: u64) -> Self {
        Self { acknowledged: true, matched, modified, ..Self::default() }
    }

    pub fn deleted(count: u64) -> Self {
        Self { acknowledged: true, deleted: count, ..Self::default() }
    }
}

/// Abstract interface over one live connection to a document database.
///
/// # Thread Safety
///
/// Implementations are shared between concurrent callers through an `Arc` and must
/// be safe to use from multiple tasks at once. The driver is expected to provide its
/// own concurrency control; the adapter adds no locking around single operations.
///
/// # Error Handling
///
/// Unreachable servers are reported as
/// [`StorageError::ConnectionFailure`](crate::error::StorageError::ConnectionFailure),
/// rejected writes as [`StorageError::WriteFailure`](crate::error::StorageError::WriteFailure).
/// Reads that match nothing return an empty vector.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Returns documents matching `filter` (all documents when `None`),
    /// sorted, skipped and limited according to `options`.
    async fn find(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        options: FindOptions,
    ) -> StorageResult<Vec<Document>>;

    /// Counts documents matching `filter`.
    async fn count(&self, collection: &str, filter: Option<&Expr>) -> StorageResult<u64>;

    /// Inserts a single document. The document carries its own `_id`.
    async fn insert_one(&self, collection: &str, document: Document) -> StorageResult<WriteResult>;

    /// Inserts several documents as one ordered batch, stopping at the first
    /// failure. A failure after at least one write is reported as
    /// [`StorageError::PartialWrite`](crate::error::StorageError::PartialWrite).
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> StorageResult<WriteResult>;

    /// Applies `set` as a field-level merge to the first document matching `filter`.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Expr,
        set: Document,
    ) -> StorageResult<WriteResult>;

    /// Applies `set` as a field-level merge to every document matching `filter`.
    async fn update_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        set: Document,
    ) -> StorageResult<WriteResult>;

    /// Removes at most one document matching `filter`.
    async fn delete_one(&self, collection: &str, filter: &Expr) -> StorageResult<WriteResult>;

    /// Removes every document matching `filter`.
    async fn delete_many(&self, collection: &str, filter: Option<&Expr>) -> StorageResult<WriteResult>;

    /// Runs a caller-supplied pipeline over the documents matching `filter`.
    ///
    /// The filter is applied before the first stage of `pipeline`.
    async fn aggregate(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        pipeline: Vec<Document>,
    ) -> StorageResult<Vec<Document>>;

    /// Lightweight connectivity check against the server.
    async fn ping(&self) -> StorageResult<()>;

    /// Closes the connection, releasing all resources.
    ///
    /// The default implementation is a no-op, but backends with external
    /// connections should override this.
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Factory opening backend connections from configuration.
///
/// The adapter calls [`build`](StoreBackendBuilder::build) on every `start()`,
/// so implementations must be reusable.
#[async_trait]
pub trait StoreBackendBuilder: Send + Sync + Debug {
    type Backend: StoreBackend + 'static;

    async fn build(&self, config: &StorageConfig) -> StorageResult<Self::Backend>;
}
