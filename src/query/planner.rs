//! Adaptive execution strategy selection for document-store queries.
//!
//! The planner picks one of four strategies from an estimated row count:
//! MEMORY for small inputs, HYBRID with disk spill and parallel lookups,
//! STREAMING through a cursor, and DISTRIBUTED across hash partitions.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use super::descriptor::QueryDescriptor;
use super::filter::merge_conditions;
use super::QueryContext;
use crate::config::{EngineConfig, StrategyThresholds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strategy {
    Memory,
    Hybrid,
    Streaming,
    Distributed,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Memory => "MEMORY",
            Strategy::Hybrid => "HYBRID",
            Strategy::Streaming => "STREAMING",
            Strategy::Distributed => "DISTRIBUTED",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MEMORY" => Ok(Strategy::Memory),
            "HYBRID" => Ok(Strategy::Hybrid),
            "STREAMING" => Ok(Strategy::Streaming),
            "DISTRIBUTED" => Ok(Strategy::Distributed),
            other => Err(format!("Unknown strategy '{}'", other)),
        }
    }
}

/// Split of a memory ceiling: 50% working set, 30% buffers, 20% cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryBudget {
    pub working_bytes: usize,
    pub buffer_bytes: usize,
    pub cache_bytes: usize,
}

impl MemoryBudget {
    pub fn split(ceiling: usize) -> Self {
        let working_bytes = ceiling / 2;
        let buffer_bytes = ceiling / 10 * 3 + ceiling % 10 * 3 / 10;
        Self {
            working_bytes,
            buffer_bytes,
            cache_bytes: ceiling - working_bytes - buffer_bytes,
        }
    }
}

/// Everything the executor needs to run a document query
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyPlan {
    pub strategy: Strategy,
    pub estimated_rows: u64,
    /// True when the estimate is the configured fallback
    pub estimate_is_fallback: bool,
    pub suggested_indexes: Vec<String>,
    pub memory_budget: MemoryBudget,
    pub parallelism: usize,
    pub allow_disk_use: bool,
    pub parallel_lookups: bool,
    /// Cursor batch size for STREAMING
    pub chunk_size: usize,
    /// Hash partition field for DISTRIBUTED
    pub partition_key: Option<String>,
}

/// Outcome of the time-boxed row-count estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowEstimate {
    pub rows: u64,
    pub fallback: bool,
}

pub struct StrategyPlanner {
    thresholds: StrategyThresholds,
    estimate_timeout: Duration,
    fallback_estimate: u64,
    chunk_size: usize,
    max_partitions: usize,
}

impl StrategyPlanner {
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        Self {
            thresholds: config.thresholds,
            estimate_timeout: config.estimate_timeout(),
            fallback_estimate: config.fallback_estimate,
            chunk_size: config.stream_chunk_size.max(1),
            max_partitions: config.max_partitions.max(1),
        }
    }

    pub fn thresholds(&self) -> StrategyThresholds {
        self.thresholds
    }

    /// Run a count query under the estimate timeout; failures yield the fallback
    pub async fn estimate<F, E>(&self, count: F) -> RowEstimate
    where
        F: Future<Output = Result<u64, E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.estimate_timeout, count).await {
            Ok(Ok(rows)) => RowEstimate {
                rows,
                fallback: false,
            },
            Ok(Err(e)) => {
                tracing::warn!(
                    "Row estimate failed, assuming {} rows: {}",
                    self.fallback_estimate,
                    e
                );
                self.fallback()
            }
            Err(_) => {
                tracing::warn!(
                    "Row estimate timed out after {:?}, assuming {} rows",
                    self.estimate_timeout,
                    self.fallback_estimate
                );
                self.fallback()
            }
        }
    }

    fn fallback(&self) -> RowEstimate {
        RowEstimate {
            rows: self.fallback_estimate,
            fallback: true,
        }
    }

    /// Strategy for an estimate; an explicit override always wins
    pub fn select_strategy(
        &self,
        descriptor: &QueryDescriptor,
        estimated_rows: u64,
        override_strategy: Option<Strategy>,
    ) -> Strategy {
        if let Some(strategy) = override_strategy {
            return strategy;
        }
        let by_size = if estimated_rows < self.thresholds.memory {
            Strategy::Memory
        } else if estimated_rows < self.thresholds.hybrid {
            Strategy::Hybrid
        } else if estimated_rows < self.thresholds.streaming {
            Strategy::Streaming
        } else {
            Strategy::Distributed
        };
        // One group over every row cannot be split across partitions
        if by_size == Strategy::Distributed && is_group_all(descriptor) {
            return Strategy::Streaming;
        }
        by_size
    }

    pub fn plan(
        &self,
        ctx: &QueryContext,
        descriptor: &QueryDescriptor,
        estimate: RowEstimate,
        override_strategy: Option<Strategy>,
        memory_ceiling: usize,
    ) -> StrategyPlan {
        let mut strategy = self.select_strategy(descriptor, estimate.rows, override_strategy);
        if strategy == Strategy::Distributed && is_group_all(descriptor) {
            tracing::warn!(
                "DISTRIBUTED requested for a group-all aggregation on '{}', running STREAMING",
                ctx.entity
            );
            strategy = Strategy::Streaming;
        }
        let joins = descriptor.joins.iter().filter(|j| j.defect().is_none()).count();
        let cpus = num_cpus::get().max(1);

        let parallel_lookups = strategy == Strategy::Hybrid && joins > 1;
        let partition_key = (strategy == Strategy::Distributed)
            .then(|| partition_key(ctx, descriptor));
        let parallelism = match strategy {
            Strategy::Memory | Strategy::Streaming => 1,
            Strategy::Hybrid if parallel_lookups => joins.min(cpus),
            Strategy::Hybrid => 1,
            Strategy::Distributed => self.max_partitions.min(cpus),
        };

        let plan = StrategyPlan {
            strategy,
            estimated_rows: estimate.rows,
            estimate_is_fallback: estimate.fallback,
            suggested_indexes: suggested_indexes(ctx, descriptor),
            memory_budget: MemoryBudget::split(memory_ceiling),
            parallelism,
            allow_disk_use: strategy >= Strategy::Hybrid,
            parallel_lookups,
            chunk_size: self.chunk_size,
            partition_key,
        };
        tracing::debug!(
            "Strategy {} for '{}' (estimated {} rows, parallelism {})",
            plan.strategy,
            ctx.entity,
            plan.estimated_rows,
            plan.parallelism
        );
        plan
    }
}

impl Default for StrategyPlanner {
    fn default() -> Self {
        Self::new()
    }
}

fn is_group_all(descriptor: &QueryDescriptor) -> bool {
    !descriptor.aggregations.is_empty() && descriptor.group_by.is_empty()
}

/// First groupBy field when grouping, else the primary key
pub fn partition_key(ctx: &QueryContext, descriptor: &QueryDescriptor) -> String {
    descriptor
        .group_by
        .first()
        .cloned()
        .unwrap_or_else(|| ctx.primary_key.clone())
}

/// `idx_<entity>_<field>` for filtered, join-local and grouped fields
pub fn suggested_indexes(ctx: &QueryContext, descriptor: &QueryDescriptor) -> Vec<String> {
    let filters = merge_conditions(&ctx.backend_conditions, &descriptor.conditions);
    let fields = filters
        .iter()
        .map(|f| f.field.as_str())
        .chain(
            descriptor
                .joins
                .iter()
                .filter(|j| j.defect().is_none())
                .map(|j| j.local_field.as_str()),
        )
        .chain(descriptor.group_by.iter().map(String::as_str));

    let mut indexes: Vec<String> = Vec::new();
    for field in fields {
        let name = format!("idx_{}_{}", ctx.entity, field.replace('.', "_"));
        if !indexes.contains(&name) {
            indexes.push(name);
        }
    }
    indexes
}

/// Tuning advice derived from an execution
pub fn tuning_suggestions(
    plan: &StrategyPlan,
    elapsed: Duration,
    slow_query: Duration,
    result_bytes: usize,
) -> Vec<String> {
    let mut suggestions = Vec::new();
    if elapsed > slow_query {
        if let Some(index) = plan.suggested_indexes.first() {
            suggestions.push(format!("execution time high, add an index on {}", index));
        }
    }
    if result_bytes > plan.memory_budget.working_bytes && plan.strategy < Strategy::Streaming {
        suggestions.push("memory usage high, prefer STREAMING".to_string());
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::descriptor::{AggregateOp, AggregationSpec, JoinSpec};

    fn ctx() -> QueryContext {
        QueryContext::new("orders", "id")
    }

    #[test]
    fn test_thresholds() {
        let planner = StrategyPlanner::new();
        let d = QueryDescriptor::new();
        assert_eq!(planner.select_strategy(&d, 0, None), Strategy::Memory);
        assert_eq!(planner.select_strategy(&d, 999, None), Strategy::Memory);
        assert_eq!(planner.select_strategy(&d, 1_000, None), Strategy::Hybrid);
        assert_eq!(planner.select_strategy(&d, 99_999, None), Strategy::Hybrid);
        assert_eq!(planner.select_strategy(&d, 100_000, None), Strategy::Streaming);
        assert_eq!(planner.select_strategy(&d, 1_000_000, None), Strategy::Distributed);
    }

    #[test]
    fn test_selection_is_monotonic() {
        let planner = StrategyPlanner::new();
        let grouped = QueryDescriptor::new().with_group_by("region");
        let group_all = QueryDescriptor::new().with_aggregation(AggregationSpec::count_all());

        for d in [QueryDescriptor::new(), grouped, group_all] {
            let mut previous = Strategy::Memory;
            let mut changes = 0;
            for rows in (0..2_000_000u64).step_by(997) {
                let strategy = planner.select_strategy(&d, rows, None);
                assert!(strategy >= previous);
                if strategy != previous {
                    changes += 1;
                }
                previous = strategy;
            }
            assert!(changes <= 3);
        }
    }

    #[test]
    fn test_override_wins() {
        let planner = StrategyPlanner::new();
        let d = QueryDescriptor::new();
        assert_eq!(
            planner.select_strategy(&d, 10, Some(Strategy::Distributed)),
            Strategy::Distributed
        );
    }

    #[test]
    fn test_group_all_capped_at_streaming() {
        let planner = StrategyPlanner::new();
        let d = QueryDescriptor::new().with_aggregation(AggregationSpec::new(AggregateOp::Sum, "total"));
        assert_eq!(planner.select_strategy(&d, 5_000_000, None), Strategy::Streaming);
    }

    #[test]
    fn test_plan_details() {
        let planner = StrategyPlanner::new();
        let d = QueryDescriptor::new()
            .with_condition("status", "PAID")
            .with_join(JoinSpec::new("customers", "customerId", "id"))
            .with_join(JoinSpec::new("stores", "storeId", "id"))
            .with_group_by("region");

        let estimate = RowEstimate { rows: 50_000, fallback: false };
        let plan = planner.plan(&ctx(), &d, estimate, None, 1_000);
        assert_eq!(plan.strategy, Strategy::Hybrid);
        assert!(plan.allow_disk_use);
        assert!(plan.parallel_lookups);
        assert!(plan.parallelism >= 1 && plan.parallelism <= 2);
        assert_eq!(
            plan.suggested_indexes,
            vec![
                "idx_orders_status",
                "idx_orders_customerId",
                "idx_orders_storeId",
                "idx_orders_region"
            ]
        );
        assert_eq!(
            plan.memory_budget,
            MemoryBudget { working_bytes: 500, buffer_bytes: 300, cache_bytes: 200 }
        );

        let plan = planner.plan(&ctx(), &d, RowEstimate { rows: 2_000_000, fallback: false }, None, 1_000);
        assert_eq!(plan.partition_key.as_deref(), Some("region"));
        assert!(plan.parallelism <= num_cpus::get());
    }

    #[test]
    fn test_memory_budget_split_at_ceiling_extremes() {
        let budget = MemoryBudget::split(usize::MAX);
        assert_eq!(budget.working_bytes, usize::MAX / 2);
        assert_eq!(
            budget.working_bytes + budget.buffer_bytes + budget.cache_bytes,
            usize::MAX
        );

        assert_eq!(
            MemoryBudget::split(7),
            MemoryBudget { working_bytes: 3, buffer_bytes: 2, cache_bytes: 2 }
        );
    }

    #[tokio::test]
    async fn test_estimate_falls_back() {
        let config = EngineConfig {
            estimate_timeout_ms: 20,
            fallback_estimate: 42,
            ..EngineConfig::default()
        };
        let planner = StrategyPlanner::with_config(&config);

        let ok = planner.estimate(async { Ok::<u64, String>(7) }).await;
        assert_eq!(ok, RowEstimate { rows: 7, fallback: false });

        let failed = planner.estimate(async { Err::<u64, String>("boom".into()) }).await;
        assert_eq!(failed, RowEstimate { rows: 42, fallback: true });

        let slow = planner
            .estimate(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<u64, String>(1)
            })
            .await;
        assert!(slow.fallback);
    }

    #[test]
    fn test_tuning_suggestions() {
        let planner = StrategyPlanner::new();
        let d = QueryDescriptor::new().with_condition("status", "PAID");
        let plan = planner.plan(&ctx(), &d, RowEstimate { rows: 10, fallback: false }, None, 1_000);

        let suggestions = tuning_suggestions(&plan, Duration::from_secs(2), Duration::from_secs(1), 900);
        assert_eq!(
            suggestions,
            vec![
                "execution time high, add an index on idx_orders_status".to_string(),
                "memory usage high, prefer STREAMING".to_string()
            ]
        );
        assert!(tuning_suggestions(&plan, Duration::ZERO, Duration::from_secs(1), 10).is_empty());
    }
}
