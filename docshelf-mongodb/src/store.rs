use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use bson::{Document, doc};
use mongodb::{
    Client, Collection as MongoCollection,
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{ClientOptions, Credential, FindOptions as MongoFindOptions},
};
use tracing::debug;

use docshelf_core::{
    backend::{FindOptions, StoreBackend, StoreBackendBuilder, WriteResult},
    config::StorageConfig,
    document::{ID_FIELD, id_string},
    error::{StorageError, StorageResult},
    query::Expr,
};

use crate::{sanitizer::KeySanitizer, query::MongoQueryTranslator};

/// Server error code for unique index violations.
const DUPLICATE_KEY_CODE: i32 = 11000;


/// MongoDB connection handle.
///
/// Cloning is cheap: the driver's [`Client`] is itself a shared connection pool.
#[derive(Debug, Clone)]
pub struct MongoDbStore {
    client: Client,
    database: String,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    pub fn builder() -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new()
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client
            .database(&self.database)
            .collection(&KeySanitizer::sanitize_key(collection_name))
    }

    fn map_error(error: MongoError, collection: &str) -> StorageError {
        match error.kind.as_ref() {
            ErrorKind::ServerSelection { .. }
            | ErrorKind::Io(_)
            | ErrorKind::ConnectionPoolCleared { .. }
            | ErrorKind::Authentication { .. }
            | ErrorKind::DnsResolve { .. } => StorageError::ConnectionFailure(error.to_string()),
            ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY_CODE => {
                StorageError::DuplicateKey(write_error.message.clone(), collection.to_string())
            },
            ErrorKind::Write(_) | ErrorKind::InsertMany(_) => StorageError::WriteFailure(error.to_string()),
            _ => StorageError::Backend(error.to_string()),
        }
    }

    /// Inserts are ordered, so the index of the first failed write is the
    /// number of documents already written.
    fn map_insert_many_error(error: MongoError, collection: &str) -> StorageError {
        let first_failure = match error.kind.as_ref() {
            ErrorKind::InsertMany(failure) => failure
                .write_errors
                .as_ref()
                .and_then(|errors| errors.iter().min_by_key(|e| e.index))
                .map(|e| (e.index as u64, e.code, e.message.clone())),
            _ => None,
        };

        match first_failure {
            Some((index, code, message)) => {
                let source = if code == DUPLICATE_KEY_CODE {
                    StorageError::DuplicateKey(message, collection.to_string())
                } else {
                    StorageError::WriteFailure(message)
                };

                if index == 0 {
                    source
                } else {
                    StorageError::PartialWrite { affected: index, source: Box::new(source) }
                }
            },
            None => Self::map_error(error, collection),
        }
    }

    async fn collect(
        cursor: mongodb::Cursor<Document>,
        collection: &str,
    ) -> StorageResult<Vec<Document>> {
        Ok(
            cursor
                .try_collect::<Vec<Document>>()
                .await
                .map_err(|e| Self::map_error(e, collection))?
                .into_iter()
                .map(KeySanitizer::restore_document)
                .collect()
        )
    }

    /// Sanitized `$set` update; the stored `_id` is immutable.
    fn set_update(mut set: Document) -> Document {
        set.remove(ID_FIELD);
        doc! { "$set": KeySanitizer::sanitize_document(set) }
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn find(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        options: FindOptions,
    ) -> StorageResult<Vec<Document>> {
        let mut find_options = MongoFindOptions::default();

        if !options.sort.is_empty() {
            find_options.sort = Some(MongoQueryTranslator::sort(&options.sort));
        }
        if options.skip > 0 {
            find_options.skip = Some(options.skip as u64);
        }
        if let Some(limit) = options.limit {
            find_options.limit = Some(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let cursor = self.get_collection(collection)
            .find(MongoQueryTranslator::translate(filter)?)
            .with_options(find_options)
            .await
            .map_err(|e| Self::map_error(e, collection))?;

        Self::collect(cursor, collection).await
    }

    async fn count(&self, collection: &str, filter: Option<&Expr>) -> StorageResult<u64> {
        self.get_collection(collection)
            .count_documents(MongoQueryTranslator::translate(filter)?)
            .await
            .map_err(|e| Self::map_error(e, collection))
    }

    async fn insert_one(&self, collection: &str, document: Document) -> StorageResult<WriteResult> {
        let id = document.get(ID_FIELD).and_then(id_string);

        self.get_collection(collection)
            .insert_one(KeySanitizer::sanitize_document(document))
            .await
            .map_err(|e| match (Self::map_error(e, collection), id) {
                (StorageError::DuplicateKey(_, collection), Some(id)) => StorageError::DuplicateKey(id, collection),
                (other, _) => other,
            })?;

        Ok(WriteResult::inserted(1))
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> StorageResult<WriteResult> {
        if documents.is_empty() {
            return Ok(WriteResult::inserted(0));
        }

        let result = self.get_collection(collection)
            .insert_many(documents.into_iter().map(KeySanitizer::sanitize_document))
            .await
            .map_err(|e| Self::map_insert_many_error(e, collection))?;

        Ok(WriteResult::inserted(result.inserted_ids.len() as u64))
    }

    async fn update_one(&self, collection: &str, filter: &Expr, set: Document) -> StorageResult<WriteResult> {
        let result = self.get_collection(collection)
            .update_one(MongoQueryTranslator::translate(Some(filter))?, Self::set_update(set))
            .await
            .map_err(|e| Self::map_error(e, collection))?;

        Ok(WriteResult::updated(result.matched_count, result.modified_count))
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        set: Document,
    ) -> StorageResult<WriteResult> {
        let result = self.get_collection(collection)
            .update_many(MongoQueryTranslator::translate(filter)?, Self::set_update(set))
            .await
            .map_err(|e| Self::map_error(e, collection))?;

        Ok(WriteResult::updated(result.matched_count, result.modified_count))
    }

    async fn delete_one(&self, collection: &str, filter: &Expr) -> StorageResult<WriteResult> {
        let result = self.get_collection(collection)
            .delete_one(MongoQueryTranslator::translate(Some(filter))?)
            .await
            .map_err(|e| Self::map_error(e, collection))?;

        Ok(WriteResult::deleted(result.deleted_count))
    }

    async fn delete_many(&self, collection: &str, filter: Option<&Expr>) -> StorageResult<WriteResult> {
        let result = self.get_collection(collection)
            .delete_many(MongoQueryTranslator::translate(filter)?)
            .await
            .map_err(|e| Self::map_error(e, collection))?;

        Ok(WriteResult::deleted(result.deleted_count))
    }

    async fn aggregate(
        &self,
        collection: &str,
        filter: Option<&Expr>,
        pipeline: Vec<Document>,
    ) -> StorageResult<Vec<Document>> {
        let mut stages = Vec::with_capacity(pipeline.len() + 1);
        if filter.is_some() {
            stages.push(doc! { "$match": MongoQueryTranslator::translate(filter)? });
        }
        stages.extend(pipeline);

        let cursor = self.get_collection(collection)
            .aggregate(stages)
            .await
            .map_err(|e| Self::map_error(e, collection))?;

        Self::collect(cursor, collection).await
    }

    async fn ping(&self) -> StorageResult<()> {
        self.client
            .database(&self.database)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| Self::map_error(e, &self.database))?;

        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        debug!(database = %self.database, "Shutting down MongoDB client");
        self.client.clone().shutdown().await;

        Ok(())
    }
}


/// Opens [`MongoDbStore`] handles from a [`StorageConfig`].
///
/// By default the server address, credentials and timeouts come from the
/// configuration. [`with_uri`](MongoDbStoreBuilder::with_uri) replaces the
/// address with a full connection string (replica sets, TLS options, SRV).
#[derive(Debug, Clone, Default)]
pub struct MongoDbStoreBuilder {
    uri: Option<String>,
    app_name: Option<String>,
}

impl MongoDbStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    /// Driver options for `config`. Does not contact the server.
    pub async fn client_options(&self, config: &StorageConfig) -> StorageResult<ClientOptions> {
        let uri = match &self.uri {
            Some(uri) => uri.clone(),
            None => format!("mongodb://{}", config.address()),
        };

        let mut options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| StorageError::Configuration(e.to_string()))?;

        if !config.username.is_empty() && options.credential.is_none() {
            let mut credential = Credential::default();
            credential.username = Some(config.username.clone());
            credential.password = Some(config.password.clone());
            options.credential = Some(credential);
        }

        options.connect_timeout = Some(config.connect_timeout);
        options.server_selection_timeout = Some(config.probe_timeout.max(Duration::from_millis(1)));
        if self.app_name.is_some() {
            options.app_name = self.app_name.clone();
        }

        Ok(options)
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(&self, config: &StorageConfig) -> StorageResult<Self::Backend> {
        let options = self.client_options(config).await?;
        let client = Client::with_options(options)
            .map_err(|e| StorageError::ConnectionFailure(e.to_string()))?;

        debug!(database = %config.database, "MongoDB client created");

        Ok(MongoDbStore::new(client, config.database.clone()))
    }
}
