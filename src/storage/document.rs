//! Reference evaluation of aggregation pipelines over a [`MemoryStore`].

use async_trait::async_trait;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::engine::{MemoryStore, StorageError};
use super::populate::populate;
use super::predicate::matches;
use crate::data::{get_path, set_path, sort_records, value_at, Record, Value};
use crate::document::{GroupAccumulator, GroupKey, Pipeline, PipelineOptions, Stage};
use crate::execution::{
    BackendResult, DocumentBackend, DocumentCursor, Populated, TransactionId, Transactional,
};
use crate::query::aggregates::create_accumulator;
use crate::query::descriptor::AggregateOp;
use crate::schema::PopulateNode;

/// Batch size when the caller does not ask for one
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Output documents of a pipeline run against `collection`
pub fn run_pipeline(
    store: &MemoryStore,
    collection: &str,
    pipeline: &Pipeline,
    options: &PipelineOptions,
) -> Result<Vec<Record>, StorageError> {
    let rows = store.scan(collection)?;
    run_stages(store, rows, &pipeline.stages, options)
}

fn run_stages(
    store: &MemoryStore,
    mut rows: Vec<Record>,
    stages: &[Stage],
    options: &PipelineOptions,
) -> Result<Vec<Record>, StorageError> {
    for stage in stages {
        rows = match stage {
            Stage::Match(expr) => rows.into_iter().filter(|r| matches(expr, r)).collect(),
            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
            } => {
                let source = store.scan(from)?;
                lookup(rows, &source, local_field, foreign_field, as_field, options.parallel_lookups)
            }
            Stage::Unwind {
                path,
                preserve_null_and_empty,
            } => unwind(rows, path, *preserve_null_and_empty),
            Stage::Group { key, accumulators } => group(&rows, key, accumulators),
            Stage::Project(fields) => rows.iter().map(|r| project(r, fields)).collect(),
            Stage::Sort(keys) => {
                let keys: Vec<(String, bool)> = keys
                    .iter()
                    .map(|(field, direction)| (field.clone(), *direction < 0))
                    .collect();
                sort_records(&mut rows, &keys);
                rows
            }
            Stage::Skip(n) => rows.into_iter().skip(*n as usize).collect(),
            Stage::Limit(n) => rows.into_iter().take(*n as usize).collect(),
            // No input, no count document
            Stage::Count(_) if rows.is_empty() => Vec::new(),
            Stage::Count(field) => {
                let mut out = Record::new();
                out.insert(field.clone(), Value::Int64(rows.len() as i64));
                vec![out]
            }
            Stage::Facet { data, total } => {
                let page = run_stages(store, rows.clone(), data, options)?;
                let counts = run_stages(store, rows, total, options)?;
                let mut out = Record::new();
                out.insert("data".into(), Value::Array(page.into_iter().map(Value::Object).collect()));
                out.insert("total".into(), Value::Array(counts.into_iter().map(Value::Object).collect()));
                vec![out]
            }
        };
    }
    Ok(rows)
}

/// Attach matching `source` records under `as_field` as an array
fn lookup(
    mut rows: Vec<Record>,
    source: &[Record],
    local_field: &str,
    foreign_field: &str,
    as_field: &str,
    parallel: bool,
) -> Vec<Record> {
    let mut index: HashMap<Value, Vec<&Record>> = HashMap::new();
    for record in source {
        let key = value_at(record, foreign_field);
        if !key.is_null() {
            index.entry(key).or_default().push(record);
        }
    }

    let attach = |row: &mut Record| {
        let key = value_at(row, local_field);
        let found: Vec<Value> = if key.is_null() {
            Vec::new()
        } else {
            index
                .get(&key)
                .map(|hits| hits.iter().map(|r| Value::Object((*r).clone())).collect())
                .unwrap_or_default()
        };
        set_path(row, as_field, Value::Array(found));
    };
    if parallel {
        rows.par_iter_mut().for_each(attach);
    } else {
        rows.iter_mut().for_each(attach);
    }
    rows
}

fn unwind(rows: Vec<Record>, path: &str, preserve: bool) -> Vec<Record> {
    let mut out = Vec::with_capacity(rows.len());
    for mut row in rows {
        match get_path(&row, path).cloned() {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = row.clone();
                    set_path(&mut copy, path, item);
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    row.remove(path);
                    out.push(row);
                }
            }
            Some(_) => out.push(row),
        }
    }
    out
}

/// Groups in first-appearance order; `GroupKey::All` always yields one row
fn group(rows: &[Record], key: &GroupKey, accumulators: &[GroupAccumulator]) -> Vec<Record> {
    let fields = key.fields();
    let mut positions: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut groups: Vec<(Vec<Value>, Vec<&Record>)> = Vec::new();
    if fields.is_empty() {
        groups.push((Vec::new(), rows.iter().collect()));
    } else {
        for row in rows {
            let values: Vec<Value> = fields.iter().map(|f| value_at(row, f)).collect();
            match positions.get(&values) {
                Some(&g) => groups[g].1.push(row),
                None => {
                    positions.insert(values.clone(), groups.len());
                    groups.push((values, vec![row]));
                }
            }
        }
    }

    groups
        .into_iter()
        .map(|(values, members)| {
            let mut out = Record::new();
            for (field, value) in fields.iter().zip(values) {
                set_path(&mut out, field, value);
            }
            for spec in accumulators {
                let mut acc = if spec.op == AggregateOp::Count && spec.condition.is_some() {
                    create_accumulator(AggregateOp::Count, None)
                } else {
                    create_accumulator(spec.op, spec.field.as_deref())
                };
                for row in &members {
                    if spec.condition.as_ref().map_or(true, |c| matches(c, row)) {
                        let value = spec
                            .field
                            .as_ref()
                            .map(|f| value_at(row, f))
                            .unwrap_or(Value::Null);
                        acc.accumulate(&value);
                    }
                }
                set_path(&mut out, &spec.output, acc.result());
            }
            out
        })
        .collect()
}

/// Keep only `fields`; missing paths are omitted
fn project(row: &Record, fields: &[String]) -> Record {
    let mut out = Record::new();
    for field in fields {
        if let Some(value) = get_path(row, field) {
            set_path(&mut out, field, value.clone());
        }
    }
    out
}

/// Cursor handing out a materialized result in fixed-size batches
pub struct MemoryCursor {
    rows: std::vec::IntoIter<Record>,
    batch_size: usize,
    served: Arc<AtomicUsize>,
}

#[async_trait]
impl DocumentCursor for MemoryCursor {
    async fn next_chunk(&mut self) -> BackendResult<Option<Vec<Record>>> {
        let chunk: Vec<Record> = self.rows.by_ref().take(self.batch_size).collect();
        if chunk.is_empty() {
            return Ok(None);
        }
        self.served.fetch_add(1, Ordering::Relaxed);
        Ok(Some(chunk))
    }
}

/// [`DocumentBackend`] over a shared [`MemoryStore`]
pub struct MemoryDocumentBackend {
    store: Arc<MemoryStore>,
    chunks_served: Arc<AtomicUsize>,
    aggregate_calls: AtomicUsize,
}

impl MemoryDocumentBackend {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            chunks_served: Arc::new(AtomicUsize::new(0)),
            aggregate_calls: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Cursor batches handed out so far
    pub fn chunks_served(&self) -> usize {
        self.chunks_served.load(Ordering::Relaxed)
    }

    /// `aggregate` calls so far, including estimates and counts
    pub fn aggregate_calls(&self) -> usize {
        self.aggregate_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transactional for MemoryDocumentBackend {
    async fn begin(&self) -> BackendResult<TransactionId> {
        self.store.enter("begin", "").await?;
        Ok(self.store.begin())
    }

    async fn commit(&self, tx: TransactionId) -> BackendResult<()> {
        self.store.enter("commit", "").await?;
        self.store.commit(tx).map_err(|e| e.into_backend("commit", ""))
    }

    async fn rollback(&self, tx: TransactionId) -> BackendResult<()> {
        self.store.enter("rollback", "").await?;
        self.store.rollback(tx).map_err(|e| e.into_backend("rollback", ""))
    }
}

#[async_trait]
impl DocumentBackend for MemoryDocumentBackend {
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        options: &PipelineOptions,
    ) -> BackendResult<Vec<Record>> {
        self.aggregate_calls.fetch_add(1, Ordering::Relaxed);
        self.store.enter("aggregate", collection).await?;
        run_pipeline(&self.store, collection, pipeline, options).map_err(|e| {
            e.into_backend("aggregate", collection)
                .with_context(pipeline.to_json().to_string())
        })
    }

    async fn open_cursor(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        options: &PipelineOptions,
    ) -> BackendResult<Box<dyn DocumentCursor>> {
        self.store.enter("open_cursor", collection).await?;
        let rows = run_pipeline(&self.store, collection, pipeline, options).map_err(|e| {
            e.into_backend("open_cursor", collection)
                .with_context(pipeline.to_json().to_string())
        })?;
        Ok(Box::new(MemoryCursor {
            rows: rows.into_iter(),
            batch_size: options.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            served: Arc::clone(&self.chunks_served),
        }))
    }

    async fn populate(
        &self,
        collection: &str,
        records: Vec<Record>,
        relations: &[PopulateNode],
    ) -> BackendResult<Populated> {
        self.store.enter("populate", collection).await?;
        Ok(populate(&self.store, collection, records, relations))
    }
}
