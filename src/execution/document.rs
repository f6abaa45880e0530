use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Instant;

use super::{
    elapsed_ms, prepare, record_population, with_timeout, DocumentBackend,
    ExecuteError, PaginatedResult, Prepared, QueryExecutor, QueryRequest,
};
use crate::config::EngineConfig;
use crate::data::{approx_records_size, sort_records, Record, Value};
use crate::document::{DocumentCompiler, Pipeline, PipelineOptions, TOTAL_FIELD};
use crate::query::cache::{CacheKey, ResultCache};
use crate::query::planner::{tuning_suggestions, Strategy, StrategyPlan, StrategyPlanner};
use crate::schema::RelationCatalog;

/// One page of output rows with the full output count
struct Page {
    items: Vec<Record>,
    total: u64,
}

/// Runs descriptors against a document backend through the strategy planner
/// and the result cache
pub struct DocumentExecutor {
    backend: Arc<dyn DocumentBackend>,
    catalog: Arc<RelationCatalog>,
    cache: Arc<ResultCache>,
    planner: StrategyPlanner,
    config: EngineConfig,
}

impl DocumentExecutor {
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        catalog: Arc<RelationCatalog>,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self::with_config(backend, catalog, cache, EngineConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn DocumentBackend>,
        catalog: Arc<RelationCatalog>,
        cache: Arc<ResultCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            planner: StrategyPlanner::with_config(&config),
            backend,
            catalog,
            cache,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Size estimate and strategy for a request, without running it
    pub async fn plan(&self, request: &QueryRequest) -> Result<StrategyPlan, ExecuteError> {
        let prepared = prepare(&self.catalog, request)?;
        Ok(self.plan_prepared(&prepared, request).await)
    }

    async fn plan_prepared(&self, prepared: &Prepared, request: &QueryRequest) -> StrategyPlan {
        let compiler = DocumentCompiler::new(&prepared.ctx);
        let estimate_pipeline = compiler.compile_estimate(&request.descriptor);
        let estimate = self
            .planner
            .estimate(self.count(&request.entity, &estimate_pipeline))
            .await;
        let ceiling = request
            .options
            .memory_ceiling_bytes
            .unwrap_or(self.config.memory_ceiling_bytes);
        self.planner.plan(
            &prepared.ctx,
            &request.descriptor,
            estimate,
            request.options.strategy_override,
            ceiling,
        )
    }

    async fn run(&self, request: &QueryRequest, started: Instant) -> Result<PaginatedResult, ExecuteError> {
        let prepared = prepare(&self.catalog, request)?;
        let key = CacheKey::derive(&prepared.ctx, &request.descriptor);

        if request.options.use_cache {
            if let Some(mut hit) = self.cache.get(&key) {
                hit.metadata.cache_hit = true;
                hit.metadata.query_time_ms = elapsed_ms(started);
                tracing::debug!("Cache hit for {}", key.as_str());
                return Ok(hit);
            }
        }

        let plan = self.plan_prepared(&prepared, request).await;
        let options = PipelineOptions {
            allow_disk_use: plan.allow_disk_use,
            parallel_lookups: plan.parallel_lookups,
            batch_size: (plan.strategy == Strategy::Streaming).then_some(plan.chunk_size),
        };

        let compiler = DocumentCompiler::new(&prepared.ctx);
        let page = match plan.strategy {
            Strategy::Memory | Strategy::Hybrid => {
                self.run_faceted(request, &compiler.compile(&request.descriptor), &options)
                    .await?
            }
            Strategy::Streaming => {
                let data = compiler.compile_unpaged(&request.descriptor);
                let count = compiler.compile_count(&request.descriptor);
                self.run_streaming(request, &data, &count, &options).await?
            }
            Strategy::Distributed => {
                let key_field = plan
                    .partition_key
                    .clone()
                    .unwrap_or_else(|| prepared.ctx.primary_key.clone());
                let partitions = plan.parallelism.max(1);
                let pipelines: Vec<Pipeline> = (0..partitions)
                    .map(|i| compiler.compile_partition(&request.descriptor, &key_field, partitions, i))
                    .collect();
                self.run_distributed(request, &pipelines, &options).await?
            }
        };

        let populated = self
            .backend
            .populate(&request.entity, page.items, &prepared.ctx.populate)
            .await?;

        let mut metadata = prepared.metadata(request);
        record_population(&mut metadata, &populated);
        metadata.strategy = Some(plan.strategy);
        metadata.estimated_rows = Some(plan.estimated_rows);
        let elapsed = started.elapsed();
        metadata.suggestions = tuning_suggestions(
            &plan,
            elapsed,
            self.config.slow_query(),
            approx_records_size(&populated.records),
        );
        metadata.query_time_ms = elapsed_ms(started);

        let result = PaginatedResult::new(
            populated.records,
            page.total,
            request.descriptor.pagination,
            metadata,
        );
        if request.options.use_cache {
            self.cache.put(key, result.clone(), request.options.cache_ttl);
        }

        tracing::info!(
            "'{}' returned {} of {} rows via {} in {}ms",
            request.entity,
            result.items.len(),
            result.total,
            plan.strategy,
            result.metadata.query_time_ms
        );
        Ok(result)
    }

    /// Single round trip; a paginated pipeline yields `{data, total: [{total}]}`
    async fn run_faceted(
        &self,
        request: &QueryRequest,
        pipeline: &Pipeline,
        options: &PipelineOptions,
    ) -> Result<Page, ExecuteError> {
        let rows = self
            .backend
            .aggregate(&request.entity, pipeline, options)
            .await?;
        if !pipeline.is_paginated() {
            let total = rows.len() as u64;
            return Ok(Page { items: rows, total });
        }

        let Some(facet) = rows.into_iter().next() else {
            return Ok(Page {
                items: Vec::new(),
                total: 0,
            });
        };
        let items = match facet.get("data") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Object(record) => Ok(record.clone()),
                    other => Err(ExecuteError::Malformed(format!(
                        "facet item is {}, expected an object",
                        other.type_name()
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(ExecuteError::Malformed("facet is missing 'data'".into())),
        };
        let total = match facet.get(TOTAL_FIELD) {
            Some(Value::Array(counts)) => match counts.first() {
                Some(Value::Object(count)) => total_of(count)?,
                Some(other) => {
                    return Err(ExecuteError::Malformed(format!(
                        "facet total is {}",
                        other.type_name()
                    )))
                }
                None => 0,
            },
            _ => return Err(ExecuteError::Malformed("facet is missing 'total'".into())),
        };
        Ok(Page { items, total })
    }

    /// Cursor over the unpaged pipeline, stopping once the page is filled,
    /// alongside a concurrent count
    async fn run_streaming(
        &self,
        request: &QueryRequest,
        data: &Pipeline,
        count: &Pipeline,
        options: &PipelineOptions,
    ) -> Result<Page, ExecuteError> {
        let (skip, take) = match &request.descriptor.pagination {
            Some(p) => (p.skip(), Some(p.limit)),
            None => (0, None),
        };

        let page = async {
            let mut cursor = self
                .backend
                .open_cursor(&request.entity, data, options)
                .await?;
            let mut seen: u64 = 0;
            let mut items = Vec::new();
            let mut chunks = 0usize;
            while let Some(chunk) = cursor.next_chunk().await? {
                chunks += 1;
                for row in chunk {
                    if seen >= skip {
                        items.push(row);
                    }
                    seen += 1;
                    if take.is_some_and(|t| items.len() as u64 >= t) {
                        break;
                    }
                }
                if take.is_some_and(|t| items.len() as u64 >= t) {
                    break;
                }
            }
            tracing::debug!("Streamed {} chunks for '{}'", chunks, request.entity);
            Ok::<_, ExecuteError>(items)
        };
        let total = self.count(&request.entity, count);
        let (items, total) = tokio::try_join!(page, total)?;
        Ok(Page { items, total })
    }

    /// Partitions run concurrently; the merge re-sorts and re-pages
    async fn run_distributed(
        &self,
        request: &QueryRequest,
        pipelines: &[Pipeline],
        options: &PipelineOptions,
    ) -> Result<Page, ExecuteError> {
        let parts = try_join_all(
            pipelines
                .iter()
                .map(|p| self.backend.aggregate(&request.entity, p, options)),
        )
        .await?;

        let mut merged: Vec<Record> = parts.into_iter().flatten().collect();
        if let Some(first) = pipelines.first() {
            sort_records(&mut merged, &first.sort_keys());
        }
        let total = merged.len() as u64;
        let items = match &request.descriptor.pagination {
            Some(p) => merged
                .into_iter()
                .skip(p.skip() as usize)
                .take(p.limit as usize)
                .collect(),
            None => merged,
        };
        tracing::debug!(
            "Merged {} partitions for '{}' into {} rows",
            pipelines.len(),
            request.entity,
            total
        );
        Ok(Page { items, total })
    }

    /// Run a pipeline ending in `$count`; no output row means zero
    async fn count(&self, collection: &str, pipeline: &Pipeline) -> Result<u64, ExecuteError> {
        let rows = self
            .backend
            .aggregate(collection, pipeline, &PipelineOptions::default())
            .await?;
        match rows.first() {
            Some(row) => total_of(row),
            None => Ok(0),
        }
    }
}

fn total_of(row: &Record) -> Result<u64, ExecuteError> {
    row.get(TOTAL_FIELD)
        .and_then(Value::as_i64)
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| ExecuteError::Malformed(format!("no '{}' in count output", TOTAL_FIELD)))
}

#[async_trait]
impl QueryExecutor for DocumentExecutor {
    async fn find_paginated(&self, request: &QueryRequest) -> Result<PaginatedResult, ExecuteError> {
        let started = Instant::now();
        let timeout = request.options.timeout.or_else(|| self.config.query_timeout());
        with_timeout(&request.entity, timeout, self.run(request, started)).await
    }
}
