//! Error types and result types for storage operations.
//!
//! Use [`StorageResult<T>`] as the return type for fallible operations. Reads that
//! match nothing are not errors: they return `Ok(None)` or an empty vector.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors that can occur when interacting with a storage adapter.
///
/// Connection-level failures ([`StorageError::NotConnected`], [`StorageError::ConnectionFailure`])
/// are kept apart from per-operation failures so callers can build retry logic on them.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An operation was attempted while no live connection handle exists.
    #[error("Not connected")]
    NotConnected,
    /// The backing store was unreachable or rejected the connection.
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),
    /// An insert, update or delete was not acknowledged by the backing store.
    #[error("Write failure: {0}")]
    WriteFailure(String),
    /// A batch write stopped part way. `affected` documents were already written.
    #[error("Batch write stopped after {affected} document(s): {source}")]
    PartialWrite {
        affected: u64,
        #[source]
        source: Box<StorageError>,
    },
    /// Required configuration values were missing or malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The query or filter could not be interpreted.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    /// The document has an invalid structure.
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    /// A document with the given ID already exists in the collection.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document {0} already exists in collection {1}")]
    DuplicateKey(String, String),
    /// Serialization/deserialization error when converting between document formats (BSON, JSON).
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Returns `true` for errors caused by a missing or broken connection.
    pub fn is_connection_error(&self) -> bool {
        match self {
            StorageError::NotConnected | StorageError::ConnectionFailure(_) => true,
            StorageError::PartialWrite { source, .. } => source.is_connection_error(),
            _ => false,
        }
    }
}

/// A specialized `Result` type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl From<BsonError> for StorageError {
    fn from(err: BsonError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for StorageError {
    fn from(err: SerdeJsonError) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
