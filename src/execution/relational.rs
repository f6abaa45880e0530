use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use super::{
    elapsed_ms, prepare, record_population, with_timeout, ExecuteError, PaginatedResult,
    QueryExecutor, QueryRequest, RelationalBackend,
};
use crate::config::EngineConfig;
use crate::relational::RelationalCompiler;
use crate::schema::RelationCatalog;

/// Runs descriptors against a relational backend
pub struct RelationalExecutor {
    backend: Arc<dyn RelationalBackend>,
    catalog: Arc<RelationCatalog>,
    config: EngineConfig,
}

impl RelationalExecutor {
    pub fn new(backend: Arc<dyn RelationalBackend>, catalog: Arc<RelationCatalog>) -> Self {
        Self::with_config(backend, catalog, EngineConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn RelationalBackend>,
        catalog: Arc<RelationCatalog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            backend,
            catalog,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn RelationalBackend> {
        &self.backend
    }

    async fn run(&self, request: &QueryRequest, started: Instant) -> Result<PaginatedResult, ExecuteError> {
        let prepared = prepare(&self.catalog, request)?;
        let compiled = RelationalCompiler::new(&prepared.ctx).compile(&request.descriptor);
        tracing::debug!("Data plan: {}", compiled.data.to_sql());
        tracing::debug!("Count plan: {}", compiled.count.to_sql());

        let data = async {
            let rows = self.backend.fetch(&compiled.data).await?;
            self.backend
                .populate(&request.entity, rows, &compiled.data.populate)
                .await
        };
        let count = self.backend.count(&compiled.count);
        let (populated, total) = tokio::try_join!(data, count)?;

        let mut metadata = prepared.metadata(request);
        record_population(&mut metadata, &populated);
        metadata.query_time_ms = elapsed_ms(started);

        let result = PaginatedResult::new(
            populated.records,
            total,
            request.descriptor.pagination,
            metadata,
        );
        tracing::info!(
            "'{}' returned {} of {} rows in {}ms",
            request.entity,
            result.items.len(),
            result.total,
            result.metadata.query_time_ms
        );
        Ok(result)
    }
}

#[async_trait]
impl QueryExecutor for RelationalExecutor {
    async fn find_paginated(&self, request: &QueryRequest) -> Result<PaginatedResult, ExecuteError> {
        let started = Instant::now();
        let timeout = request.options.timeout.or_else(|| self.config.query_timeout());
        with_timeout(&request.entity, timeout, self.run(request, started)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{value_at, Value};
    use crate::execution::{transaction, BackendErrorKind};
    use crate::query::QueryDescriptor;
    use crate::storage::{user_store, MemoryRelationalBackend, MemoryStore};

    fn executor(store: &Arc<MemoryStore>) -> RelationalExecutor {
        let catalog = Arc::new(RelationCatalog::new(store.schemas().clone()));
        RelationalExecutor::new(
            Arc::new(MemoryRelationalBackend::new(Arc::clone(store))),
            catalog,
        )
    }

    fn ids(items: &[crate::data::Record]) -> Vec<Value> {
        items.iter().map(|r| value_at(r, "id")).collect()
    }

    #[tokio::test]
    async fn test_second_page_of_active_users() {
        let store = user_store();
        let descriptor = QueryDescriptor::new()
            .with_condition("status", "ACTIVE")
            .with_pagination(2, 5);
        let result = executor(&store)
            .find_paginated(&QueryRequest::new("users", descriptor))
            .await
            .unwrap();

        assert_eq!(ids(&result.items), [7, 6, 5, 4, 3].map(Value::Int64).to_vec());
        assert_eq!(result.total, 12);
        assert_eq!(result.total_pages, 3);
        assert!(result.has_next && result.has_prev);
        assert_eq!(result.metadata.rows_returned, 5);
        assert!(!result.metadata.cache_hit);
    }

    #[tokio::test]
    async fn test_relations_loaded_and_failed() {
        let store = user_store();
        let descriptor = QueryDescriptor::new()
            .with_relations(["company", "ghost"])
            .with_pagination(1, 2);
        let result = executor(&store)
            .find_paginated(&QueryRequest::new("users", descriptor))
            .await
            .unwrap();

        assert_eq!(result.metadata.relations_loaded, vec!["company"]);
        assert_eq!(result.metadata.relation_errors.len(), 1);
        assert_eq!(result.metadata.relation_errors[0].relation, "ghost");
        // id 15 is odd
        assert_eq!(value_at(&result.items[0], "company.name"), Value::from("Hooli"));
    }

    #[tokio::test]
    async fn test_known_root_with_bad_deep_segment_stays_loaded() {
        let store = user_store();
        let descriptor = QueryDescriptor::new()
            .with_relations(["company.ghost"])
            .with_pagination(1, 2);
        let result = executor(&store)
            .find_paginated(&QueryRequest::new("users", descriptor))
            .await
            .unwrap();

        assert_eq!(result.metadata.relations_loaded, vec!["company.ghost"]);
        assert_eq!(result.metadata.relation_errors.len(), 1);
        assert_eq!(result.metadata.relation_errors[0].relation, "company.ghost");
        // The root still loads
        assert_eq!(value_at(&result.items[0], "company.name"), Value::from("Hooli"));
    }

    #[tokio::test]
    async fn test_page_far_beyond_the_end() {
        let store = user_store();
        let descriptor = QueryDescriptor::new().with_pagination(u64::MAX / 2, 4);
        let result = executor(&store)
            .find_paginated(&QueryRequest::new("users", descriptor))
            .await
            .unwrap();

        assert!(result.items.is_empty());
        assert_eq!(result.total, 15);
        assert_eq!(result.total_pages, 4);
        assert!(!result.has_next);
        assert!(result.has_prev);
    }

    #[tokio::test]
    async fn test_backend_failure_carries_context() {
        let store = user_store();
        let err = executor(&store)
            .find_paginated(&QueryRequest::new("ghosts", QueryDescriptor::new()))
            .await
            .unwrap_err();
        match err {
            ExecuteError::Backend(e) => {
                assert_eq!(e.entity, "ghosts");
                assert!(e.context.unwrap_or_default().contains("\"ghosts\""));
            }
            other => panic!("unexpected error: {other}"),
        }

        store.fail_next("count", BackendErrorKind::Connection, "refused");
        let err = executor(&store)
            .find_paginated(&QueryRequest::new("users", QueryDescriptor::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Backend(e) if e.kind == BackendErrorKind::Connection));
    }

    #[tokio::test]
    async fn test_timeout_abandons_slow_backend() {
        let store = user_store();
        store.set_latency(std::time::Duration::from_millis(300));
        let request = QueryRequest::new("users", QueryDescriptor::new())
            .with_timeout(std::time::Duration::from_millis(20));
        let err = executor(&store).find_paginated(&request).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Timeout { ref entity, .. } if entity == "users"));
    }

    #[tokio::test]
    async fn test_find_one_and_many() {
        let store = user_store();
        let executor = executor(&store);
        let request =
            QueryRequest::new("users", QueryDescriptor::new().with_condition("status", "ACTIVE"));

        let one = executor.find_one(&request).await.unwrap();
        assert_eq!(one.data.map(|r| value_at(&r, "id")), Some(Value::Int64(12)));

        let many = executor.find_many(&request).await.unwrap();
        assert_eq!(many.items.len(), 12);
        assert_eq!(many.metadata.rows_returned, 12);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let store = user_store();
        let backend = MemoryRelationalBackend::new(Arc::clone(&store));

        let writer = Arc::clone(&store);
        let kept = transaction(&backend, |_tx| async move {
            writer.insert_json("users", &[serde_json::json!({"id": 16})]);
            Ok(())
        })
        .await;
        assert!(kept.is_ok());
        assert_eq!(store.row_count("users"), 16);

        let writer = Arc::clone(&store);
        let failed: Result<(), _> = transaction(&backend, |_tx| async move {
            writer.insert_json("users", &[serde_json::json!({"id": 17})]);
            Err(ExecuteError::Malformed("abort".into()))
        })
        .await;
        assert!(failed.is_err());
        assert_eq!(store.row_count("users"), 16);
    }
}
