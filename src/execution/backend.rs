//! Backend seams the coordinator executes compiled plans through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::data::Record;
use crate::document::{Pipeline, PipelineOptions};
use crate::relational::RelationalPlan;
use crate::schema::{PopulateNode, RelationError};

/// Longest context snippet carried by a [`BackendError`]
pub const MAX_CONTEXT_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendErrorKind {
    Connection,
    Timeout,
    Constraint,
    Other,
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendErrorKind::Connection => "connection error",
            BackendErrorKind::Timeout => "timeout",
            BackendErrorKind::Constraint => "constraint violation",
            BackendErrorKind::Other => "backend error",
        };
        f.write_str(name)
    }
}

/// Failure reported by a backend while running a plan
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} in {operation} on '{entity}': {message}")]
pub struct BackendError {
    pub operation: String,
    pub entity: String,
    pub kind: BackendErrorKind,
    pub message: String,
    /// Rendered plan or other diagnostic, at most [`MAX_CONTEXT_BYTES`]
    pub context: Option<String>,
}

impl BackendError {
    pub fn new(
        operation: impl Into<String>,
        entity: impl Into<String>,
        kind: BackendErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            entity: entity.into(),
            kind,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl AsRef<str>) -> Self {
        self.context = Some(truncate(context.as_ref(), MAX_CONTEXT_BYTES).to_string());
        self
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Opaque handle of an open transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub u64);

/// Records after relation population, plus relations that could not be loaded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Populated {
    pub records: Vec<Record>,
    pub relation_errors: Vec<RelationError>,
}

#[async_trait]
pub trait Transactional: Send + Sync {
    async fn begin(&self) -> BackendResult<TransactionId>;
    async fn commit(&self, tx: TransactionId) -> BackendResult<()>;
    async fn rollback(&self, tx: TransactionId) -> BackendResult<()>;
}

#[async_trait]
pub trait RelationalBackend: Transactional {
    /// Rows produced by a data plan
    async fn fetch(&self, plan: &RelationalPlan) -> BackendResult<Vec<Record>>;

    /// Single `total` produced by a count plan
    async fn count(&self, plan: &RelationalPlan) -> BackendResult<u64>;

    /// Load relation chains onto fetched rows
    async fn populate(
        &self,
        entity: &str,
        records: Vec<Record>,
        relations: &[PopulateNode],
    ) -> BackendResult<Populated>;
}

/// Batched reader over a pipeline's output
#[async_trait]
pub trait DocumentCursor: Send {
    /// Next batch; `None` once exhausted
    async fn next_chunk(&mut self) -> BackendResult<Option<Vec<Record>>>;
}

#[async_trait]
pub trait DocumentBackend: Transactional {
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        options: &PipelineOptions,
    ) -> BackendResult<Vec<Record>>;

    async fn open_cursor(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        options: &PipelineOptions,
    ) -> BackendResult<Box<dyn DocumentCursor>>;

    async fn populate(
        &self,
        collection: &str,
        records: Vec<Record>,
        relations: &[PopulateNode],
    ) -> BackendResult<Populated>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_truncated_on_char_boundary() {
        let context = "é".repeat(400);
        let err = BackendError::new("fetch", "users", BackendErrorKind::Other, "boom")
            .with_context(&context);
        let kept = err.context.unwrap();
        assert!(kept.len() <= MAX_CONTEXT_BYTES);
        assert_eq!(kept.len(), 512);
        assert!(kept.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_display() {
        let err = BackendError::new("count", "orders", BackendErrorKind::Timeout, "slow");
        assert_eq!(err.to_string(), "timeout in count on 'orders': slow");
    }
}
