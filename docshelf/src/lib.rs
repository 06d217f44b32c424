//! Main docshelf crate providing a unified interface for document storage.
//!
//! This crate is the primary entry point for users of docshelf. It re-exports the
//! core types from the sub-crates and gives access to the storage backends.
//!
//! # Features
//!
//! - **One storage contract** - Application code depends on the [`Storage`](adapter::Storage) trait only
//! - **Upsert-merge** - Field-level merges with `_id`, `_item_id`, `_cat` and `_mat` metadata
//! - **Tenant scoping** - Filters restricted to a set of tenants
//! - **Health monitoring** - A background task keeps the availability flag current
//! - **Multiple backends** - In-memory and MongoDB storage behind the same adapter
//!
//! # Quick Start
//!
//! ```ignore
//! use docshelf::{prelude::*, memory::InMemoryStore};
//! use bson::doc;
//!
//! #[tokio::main]
//! async fn main() -> StorageResult<()> {
//!     let adapter = StorageAdapter::new(InMemoryStore::builder(), StorageConfig::default());
//!     adapter.start().await?;
//!
//!     // Insert: no id and no predicate
//!     let created = adapter
//!         .up_sert("items", None, &Filter::all(), doc! { "name": "test" })
//!         .await?;
//!
//!     // Update the same document; `name` is overwritten, other fields are kept
//!     adapter
//!         .up_sert("items", created.id.as_deref(), &Filter::all(), doc! { "name": "test2" })
//!         .await?;
//!
//!     let page = adapter
//!         .get_many("items", &Filter::all(), &Query::from_parts(Some(0), Some(10), Some(r#"{"_cat": -1}"#))?)
//!         .await?;
//!     println!("{page:?}");
//!
//!     adapter.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Tenants
//!
//! ```ignore
//! use docshelf::prelude::*;
//!
//! // Only documents whose `_tenant` is "acme" (or contains it)
//! let scoped = Filter::tenant(["acme"], Some(Predicate::eq("status", "open")));
//!
//! // An empty tenant set restricts nothing
//! let everyone = Filter::tenant(Vec::<String>::new(), None);
//! ```
//!
//! # Key/value access
//!
//! ```ignore
//! use std::sync::Arc;
//! use docshelf::{prelude::*, memory::InMemoryStore};
//!
//! let adapter = Arc::new(StorageAdapter::new(InMemoryStore::builder(), StorageConfig::default()));
//! adapter.start().await?;
//!
//! let settings = Manager::new(adapter.clone(), "settings");
//! settings.set("theme", bson::doc! { "value": "dark" }).await?;
//! let keys = settings.keys().await?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-memory storage for development and testing
//! - `mongodb` - Persistent MongoDB backend (requires the `mongodb` feature)

pub mod prelude;

pub use docshelf_core::{adapter, backend, clock, config, document, error, health, manager, query, state};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend implementations.
pub mod memory {
    pub use docshelf_memory::{InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docshelf_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}
