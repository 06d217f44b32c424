//! In-memory document storage backend for docshelf.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! It uses async-aware read-write locks for concurrent access and is meant for development,
//! testing, and small-scale deployments.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Predicate evaluation** - Filters, multi-key sorting and pagination in process
//! - **Aggregation subset** - `$match`, `$sort`, `$skip`, `$limit` and `$count` stages
//! - **Reachability switch** - Simulate an unreachable server to exercise failure paths
//!
//! # Quick Start
//!
//! ```ignore
//! use docshelf::{prelude::*, memory::InMemoryStore};
//! use bson::doc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = StorageAdapter::new(InMemoryStore::builder(), StorageConfig::default());
//!     adapter.start().await?;
//!
//!     adapter.up_sert("users", Some("alice"), &Filter::all(), doc! { "name": "Alice" }).await?;
//!
//!     adapter.stop().await;
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docshelf_memory;

pub mod store;
mod evaluator;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
