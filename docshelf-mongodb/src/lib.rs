//! MongoDB backend implementation for docshelf.
//!
//! This crate provides a MongoDB-based implementation of the `StoreBackend` trait,
//! enabling persistent document storage on top of MongoDB's query engine.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docshelf = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Server-side paging** - Filters, sort, skip and limit are executed by MongoDB
//! - **Field-level merges** - Updates are `$set` operations, untouched fields are kept
//! - **Aggregation** - Caller pipelines run after a `$match` stage for the filter scope
//! - **Key sanitization** - Payload keys containing `.` or `$` are stored escaped
//!
//! # Connection
//!
//! Host, port, credentials and database come from a
//! [`StorageConfig`](docshelf_core::config::StorageConfig); a full connection string
//! can be supplied with [`MongoDbStoreBuilder::with_uri`].
//!
//! # Example
//!
//! ```ignore
//! use docshelf::{prelude::*, mongodb::MongoDbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = StorageAdapter::new(MongoDbStore::builder(), StorageConfig::from_env()?);
//!     adapter.start().await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docshelf_mongodb;

pub mod store;
mod query;
mod sanitizer;

pub use store::{MongoDbStore, MongoDbStoreBuilder};
