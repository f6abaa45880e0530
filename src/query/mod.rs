pub mod aggregates;
pub mod cache;
pub mod descriptor;
pub mod filter;
pub mod planner;
pub mod search;

pub use cache::{CacheKey, CacheStats, ResultCache};
pub use descriptor::{
    AggregateOp, AggregationSpec, Condition, Conditions, DescriptorError, JoinSpec, JoinType,
    OperatorSet, Pagination, QueryDescriptor, SearchSpec, SortDirection, SortField, SortSpec,
};
pub use filter::{merge_conditions, FieldFilter, FilterOperator};
pub use planner::{MemoryBudget, RowEstimate, Strategy, StrategyPlan, StrategyPlanner};
pub use search::{MatchStrategy, SearchConfig, SearchPlan};

use crate::schema::PopulateNode;

/// Per-entity inputs shared by both compilers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryContext {
    pub entity: String,
    pub primary_key: String,
    /// Server-imposed conditions; they win over caller conditions on the same field
    pub backend_conditions: Conditions,
    pub search_config: SearchConfig,
    /// Resolved relation population chains
    pub populate: Vec<PopulateNode>,
}

impl QueryContext {
    pub fn new(entity: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            primary_key: primary_key.into(),
            ..Default::default()
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

    pub fn with_populate(mut self, populate: Vec<PopulateNode>) -> Self {
        self.populate = populate;
        self
    }
}

/// Join recovered from a compiled plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinDescription {
    pub source: String,
    pub alias: String,
    pub local_field: String,
    pub foreign_field: String,
}

/// Fields a compiled plan filters, joins and sorts on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanDescription {
    pub filter_fields: Vec<String>,
    pub joins: Vec<JoinDescription>,
    pub sort: Vec<SortField>,
}

#[derive(Debug, thiserror::Error)]
pub enum DescribeError {
    #[error("SQL parse error: {0}")]
    Sql(#[from] sqlparser::parser::ParserError),

    #[error("Unsupported plan element: {0}")]
    Unsupported(String),

    #[error("Malformed plan: {0}")]
    Malformed(String),
}
