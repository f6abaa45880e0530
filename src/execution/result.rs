use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{approx_records_size, Record};
use crate::query::descriptor::Pagination;
use crate::query::planner::Strategy;
use crate::schema::RelationError;

/// Execution metadata attached to every result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetadata {
    pub query_time_ms: u64,
    pub search_algorithms_used: Vec<String>,
    pub relations_loaded: Vec<String>,
    pub relation_errors: Vec<RelationError>,
    pub rows_returned: usize,
    pub relations_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    pub cache_hit: bool,
    pub executed_at: DateTime<Utc>,
}

impl Default for QueryMetadata {
    fn default() -> Self {
        Self {
            query_time_ms: 0,
            search_algorithms_used: Vec::new(),
            relations_loaded: Vec::new(),
            relation_errors: Vec::new(),
            rows_returned: 0,
            relations_requested: false,
            strategy: None,
            estimated_rows: None,
            suggestions: Vec::new(),
            cache_hit: false,
            executed_at: Utc::now(),
        }
    }
}

/// One page of items plus pagination arithmetic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResult {
    pub items: Vec<Record>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
    pub has_next: bool,
    pub has_prev: bool,
    pub metadata: QueryMetadata,
}

impl PaginatedResult {
    /// Without pagination the whole result is a single page
    pub fn new(
        items: Vec<Record>,
        total: u64,
        pagination: Option<Pagination>,
        mut metadata: QueryMetadata,
    ) -> Self {
        metadata.rows_returned = items.len();
        match pagination {
            Some(p) => Self {
                items,
                total,
                page: p.page,
                limit: p.limit,
                total_pages: p.total_pages(total),
                has_next: p.has_next(total),
                has_prev: p.has_prev(),
                metadata,
            },
            None => Self {
                limit: items.len() as u64,
                items,
                total,
                page: 1,
                total_pages: u64::from(total > 0),
                has_next: false,
                has_prev: false,
                metadata,
            },
        }
    }

    /// Approximate in-memory footprint, used by the cache's byte ceiling
    pub fn approx_size(&self) -> usize {
        approx_records_size(&self.items) + std::mem::size_of::<Self>()
    }
}

/// Array-call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResult {
    pub items: Vec<Record>,
    pub metadata: QueryMetadata,
}

/// Single-call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleResult {
    pub data: Option<Record>,
    pub metadata: QueryMetadata,
}
