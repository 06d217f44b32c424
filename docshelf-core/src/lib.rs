//! A pluggable document storage layer that sits between domain code and a document database.
//!
//! This crate is the core of the docshelf project and provides:
//!
//! - **Storage contract** ([`adapter`]) - The [`Storage`](adapter::Storage) trait and the
//!   [`StorageAdapter`](adapter::StorageAdapter) implementing upsert-merge with versioning metadata
//! - **Backend abstraction** ([`backend`]) - Traits for plugging in concrete document databases
//! - **Query and filter model** ([`query`]) - Predicates, tenant-scoped filters, pagination and sort
//! - **Health monitoring** ([`health`]) - Background connectivity validation
//! - **Key/value facade** ([`manager`]) - Single-key access for one item type
//! - **Configuration** ([`config`]) - Connection settings with defaults
//! - **Document metadata** ([`document`]) - `_id`, `_item_id`, `_cat`, `_mat` handling
//! - **Error handling** ([`error`]) - Typed errors and result alias
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
//! adapter.up_sert("items", Some("a"), &Filter::all(), doc! { "name": "test" }).await?;
//! let page = adapter.get_many("items", &Filter::all(), &Query::default()).await?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docshelf_core;

pub mod adapter;
pub mod backend;
pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod health;
pub mod manager;
pub mod query;
pub mod state;
