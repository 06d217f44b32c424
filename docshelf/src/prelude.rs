//! Convenient re-exports of commonly used types from docshelf.
//!
//! Import this prelude module to quickly access the most frequently used types
//! and traits without needing to import from multiple sub-modules:
//!
//! ```ignore
//! use docshelf::prelude::*;
//! ```
//!
//! This provides access to:
//! - The storage contract and its adapter
//! - Store backends and builders
//! - Query, filter and predicate construction
//! - The key/value manager
//! - Configuration and error types

pub use docshelf_core::{
    adapter::{Storage, StorageAdapter, WriteKind, WriteOutcome},
    backend::{StoreBackend, StoreBackendBuilder},
    clock::{Clock, ManualClock, SystemClock},
    config::{ConfigSource, EnvSource, StorageConfig},
    health::HealthStatus,
    manager::Manager,
    query::{Query, QueryBuilder, QueryVisitor, Expr, Filter, Predicate, Sort, SortDirection, FieldOp},
    state::ConnectionState,
    error::{StorageError, StorageResult},
};
