//! Polyquery: one query descriptor, two kinds of backend
//!
//! A [`QueryDescriptor`] describes filtering, search, joins, grouping,
//! sorting, pagination and relation loading once. It compiles either into a
//! parameterized relational plan (rendered as SQL) or into a document
//! aggregation pipeline, and both produce the same paginated result shape.
//!
//! # Features
//!
//! - **Relation Catalog**: Per-entity relation discovery from schemas, cached process-wide
//! - **Deep Relations**: Dotted paths like `customer.address` validated by their root
//! - **Relational Compiler**: Parameterized plans with joins, grouping and conditional aggregates
//! - **Document Compiler**: `$match`/`$lookup`/`$group`/`$facet` pipelines
//! - **Strategy Planner**: MEMORY, HYBRID, STREAMING or DISTRIBUTED by estimated size
//! - **Result Cache**: TTL plus entry and byte bounds with LRU eviction
//! - **In-Memory Backends**: Reference evaluators for both plan kinds
//!
//! # Example
//!
//! ```no_run
//! use polyquery::execution::{QueryExecutor, QueryRequest, RelationalExecutor};
//! use polyquery::query::QueryDescriptor;
//! use polyquery::schema::RelationCatalog;
//! use polyquery::storage::{MemoryRelationalBackend, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), polyquery::QueryError> {
//! let store = Arc::new(MemoryStore::new());
//! store.insert_json("users", &[serde_json::json!({"id": 1, "status": "ACTIVE"})]);
//!
//! let catalog = Arc::new(RelationCatalog::new(store.schemas().clone()));
//! let executor = RelationalExecutor::new(
//!     Arc::new(MemoryRelationalBackend::new(store)),
//!     catalog,
//! );
//!
//! let descriptor = QueryDescriptor::new()
//!     .with_condition("status", "ACTIVE")
//!     .with_pagination(1, 10);
//! let result = executor
//!     .find_paginated(&QueryRequest::new("users", descriptor))
//!     .await?;
//! println!("{} of {}", result.items.len(), result.total);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod document;
pub mod execution;
pub mod query;
pub mod relational;
pub mod schema;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig, StrategyThresholds};
pub use data::{DataType, Record, Value};
pub use execution::{
    DocumentExecutor, ExecuteError, PaginatedResult, QueryExecutor, QueryMetadata, QueryOptions,
    QueryRequest, RelationalExecutor,
};
pub use query::{QueryDescriptor, ResultCache, Strategy, StrategyPlanner};
pub use schema::{EntitySchema, FieldDef, RelationCatalog, SchemaRegistry};
pub use storage::{MemoryDocumentBackend, MemoryRelationalBackend, MemoryStore};

/// Any failure surfaced by the public API
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] schema::SchemaError),

    #[error(transparent)]
    Descriptor(#[from] query::DescriptorError),

    #[error(transparent)]
    Describe(#[from] query::DescribeError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error(transparent)]
    Backend(#[from] execution::BackendError),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}
