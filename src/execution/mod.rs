//! Execution coordinator.
//!
//! Executors compile a request for their backend, run the data and count
//! halves concurrently and assemble a [`PaginatedResult`] with metadata.

pub mod backend;
pub mod document;
pub mod relational;
pub mod result;

pub use backend::{
    BackendError, BackendErrorKind, BackendResult, DocumentBackend, DocumentCursor, Populated,
    RelationalBackend, TransactionId, Transactional, MAX_CONTEXT_BYTES,
};
pub use document::DocumentExecutor;
pub use relational::RelationalExecutor;
pub use result::{ListResult, PaginatedResult, QueryMetadata, SingleResult};

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::query::descriptor::{Conditions, DescriptorError, Pagination, QueryDescriptor};
use crate::query::planner::Strategy;
use crate::query::search::{plan_search, SearchConfig};
use crate::query::QueryContext;
use crate::schema::{resolve_relations, RelationCatalog, RelationResolution};

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Query on '{entity}' timed out after {elapsed_ms}ms")]
    Timeout { entity: String, elapsed_ms: u64 },

    #[error("Malformed backend response: {0}")]
    Malformed(String),
}

/// Per-request execution knobs
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Abandon the query after this long; falls back to the engine default
    pub timeout: Option<Duration>,
    /// Result cache TTL; falls back to the cache default
    pub cache_ttl: Option<Duration>,
    pub use_cache: bool,
    pub strategy_override: Option<Strategy>,
    pub memory_ceiling_bytes: Option<usize>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            cache_ttl: None,
            use_cache: true,
            strategy_override: None,
            memory_ceiling_bytes: None,
        }
    }
}

/// Everything a caller hands the engine for one query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub entity: String,
    pub descriptor: QueryDescriptor,
    /// Server-imposed conditions, winning over the descriptor's on the same field
    pub backend_conditions: Conditions,
    pub search_config: SearchConfig,
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(entity: impl Into<String>, descriptor: QueryDescriptor) -> Self {
        Self {
            entity: entity.into(),
            descriptor,
            backend_conditions: Conditions::new(),
            search_config: SearchConfig::default(),
            options: QueryOptions::default(),
        }
    }

    pub fn with_backend_conditions(mut self, conditions: Conditions) -> Self {
        self.backend_conditions = conditions;
        self
    }

    pub fn with_search_config(mut self, config: SearchConfig) -> Self {
        self.search_config = config;
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.options.strategy_override = Some(strategy);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.options.cache_ttl = Some(ttl);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.options.use_cache = false;
        self
    }
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn find_paginated(&self, request: &QueryRequest) -> Result<PaginatedResult, ExecuteError>;

    /// Every matching item; pagination still applies when the descriptor has one
    async fn find_many(&self, request: &QueryRequest) -> Result<ListResult, ExecuteError> {
        let result = self.find_paginated(request).await?;
        Ok(ListResult {
            items: result.items,
            metadata: result.metadata,
        })
    }

    /// First matching item
    async fn find_one(&self, request: &QueryRequest) -> Result<SingleResult, ExecuteError> {
        let mut single = request.clone();
        single.descriptor.pagination = Some(Pagination::new(1, 1));
        let result = self.find_paginated(&single).await?;
        Ok(SingleResult {
            data: result.items.into_iter().next(),
            metadata: result.metadata,
        })
    }
}

/// A validated request with its compile context
pub(crate) struct Prepared {
    pub ctx: QueryContext,
    pub resolution: RelationResolution,
    pub search_algorithms: Vec<String>,
}

impl Prepared {
    /// Metadata before any backend work
    pub fn metadata(&self, request: &QueryRequest) -> QueryMetadata {
        QueryMetadata {
            search_algorithms_used: self.search_algorithms.clone(),
            relations_loaded: self.resolution.valid_relations.clone(),
            relation_errors: self.resolution.failed_relations.clone(),
            relations_requested: !request.descriptor.relations.is_empty(),
            ..QueryMetadata::default()
        }
    }
}

pub(crate) fn prepare(
    catalog: &RelationCatalog,
    request: &QueryRequest,
) -> Result<Prepared, ExecuteError> {
    request.descriptor.validate()?;

    let resolution = resolve_relations(catalog, &request.entity, &request.descriptor.relations);
    let ctx = QueryContext::new(&request.entity, catalog.primary_key(&request.entity))
        .with_backend_conditions(request.backend_conditions.clone())
        .with_search_config(request.search_config.clone())
        .with_populate(resolution.populate.clone());
    let search_algorithms = plan_search(request.descriptor.search.as_ref(), &ctx.search_config)
        .map(|plan| plan.algorithms_used())
        .unwrap_or_default();

    Ok(Prepared {
        ctx,
        resolution,
        search_algorithms,
    })
}

/// Fold deep segments the backend failed to load into the metadata.
/// Known-root paths stay in `relations_loaded`; only the soft error is added.
pub(crate) fn record_population(metadata: &mut QueryMetadata, populated: &Populated) {
    for error in &populated.relation_errors {
        if !metadata.relation_errors.contains(error) {
            metadata.relation_errors.push(error.clone());
        }
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Run `fut`, abandoning it once `timeout` passes
pub(crate) async fn with_timeout<T, F>(
    entity: &str,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T, ExecuteError>
where
    F: Future<Output = Result<T, ExecuteError>>,
{
    let Some(limit) = timeout else {
        return fut.await;
    };
    let started = Instant::now();
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            let elapsed_ms = elapsed_ms(started);
            tracing::warn!("Query on '{}' abandoned after {}ms", entity, elapsed_ms);
            Err(ExecuteError::Timeout {
                entity: entity.to_string(),
                elapsed_ms,
            })
        }
    }
}

/// Run `f` inside a backend transaction: commit on success, roll back on error
pub async fn transaction<B, F, Fut, T>(backend: &B, f: F) -> Result<T, ExecuteError>
where
    B: Transactional + ?Sized,
    F: FnOnce(TransactionId) -> Fut,
    Fut: Future<Output = Result<T, ExecuteError>>,
{
    let tx = backend.begin().await?;
    match f(tx).await {
        Ok(value) => {
            backend.commit(tx).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = backend.rollback(tx).await {
                tracing::warn!("Rollback of transaction {} failed: {}", tx.0, rollback);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataType;
    use crate::schema::{EntitySchema, FieldDef, SchemaRegistry};
    use std::sync::Arc;

    fn catalog() -> RelationCatalog {
        let registry = SchemaRegistry::new();
        registry.register(
            EntitySchema::new("orders")
                .with_primary_key("orderId")
                .with_field(FieldDef::scalar("status", DataType::String))
                .with_field(FieldDef::reference("customer", "users")),
        );
        RelationCatalog::new(Arc::new(registry))
    }

    #[test]
    fn test_prepare_resolves_context() {
        let descriptor = QueryDescriptor::new()
            .with_relations(["customer.address", "ghost"])
            .with_search("ada", ["status"]);
        let request = QueryRequest::new("orders", descriptor);
        let prepared = prepare(&catalog(), &request).unwrap();

        assert_eq!(prepared.ctx.primary_key, "orderId");
        assert_eq!(prepared.ctx.populate.len(), 1);
        assert_eq!(prepared.search_algorithms, vec!["contains"]);

        let metadata = prepared.metadata(&request);
        assert!(metadata.relations_requested);
        assert_eq!(metadata.relations_loaded, vec!["customer.address"]);
        assert_eq!(metadata.relation_errors[0].relation, "ghost");
    }

    #[test]
    fn test_prepare_rejects_invalid_pagination() {
        let request = QueryRequest::new("orders", QueryDescriptor::new().with_pagination(0, 10));
        assert!(matches!(
            prepare(&catalog(), &request),
            Err(ExecuteError::Descriptor(DescriptorError::InvalidPage(0)))
        ));
    }

    #[tokio::test]
    async fn test_with_timeout_abandons() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ExecuteError>(1)
        };
        let result = with_timeout("orders", Some(Duration::from_millis(20)), slow).await;
        assert!(matches!(result, Err(ExecuteError::Timeout { .. })));

        let fast = async { Ok::<_, ExecuteError>(2) };
        assert_eq!(with_timeout("orders", None, fast).await.unwrap(), 2);
    }
}
