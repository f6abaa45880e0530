use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::data::{approx_records_size, record_from_json, Record};
use crate::execution::{BackendError, BackendErrorKind, TransactionId};
use crate::schema::{EntitySchema, SchemaRegistry};

type Table = Arc<RwLock<Vec<Record>>>;

/// In-process tables and collections shared by the in-memory backends
pub struct MemoryStore {
    tables: DashMap<String, Table>,
    schemas: Arc<SchemaRegistry>,
    /// Table snapshots taken at `begin`, restored on rollback
    transactions: Mutex<HashMap<u64, HashMap<String, Vec<Record>>>>,
    next_tx: AtomicU64,
    /// Operation name -> failure to report on its next call
    faults: DashMap<String, (BackendErrorKind, String)>,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_schemas(Arc::new(SchemaRegistry::new()))
    }

    pub fn with_schemas(schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            tables: DashMap::new(),
            schemas,
            transactions: Mutex::new(HashMap::new()),
            next_tx: AtomicU64::new(1),
            faults: DashMap::new(),
            latency_ms: AtomicU64::new(0),
        }
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Register an entity schema and create its (empty) table
    pub fn define(&self, schema: EntitySchema) {
        self.get_or_create_table(&schema.name);
        self.schemas.register(schema);
    }

    fn get_or_create_table(&self, name: &str) -> Table {
        if let Some(table) = self.tables.get(name) {
            return Arc::clone(&table);
        }
        Arc::clone(
            self.tables
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
                .value(),
        )
    }

    /// Insert a row (creates the table if it does not exist)
    pub fn insert(&self, table: &str, record: Record) {
        self.get_or_create_table(table).write().push(record);
    }

    pub fn insert_batch(&self, table: &str, records: Vec<Record>) -> usize {
        let count = records.len();
        self.get_or_create_table(table).write().extend(records);
        count
    }

    /// Insert JSON objects; non-object items are skipped with a warning
    pub fn insert_json(&self, table: &str, items: &[serde_json::Value]) -> usize {
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match record_from_json(item) {
                Some(record) => records.push(record),
                None => tracing::warn!("Skipping non-object row for '{}': {}", table, item),
            }
        }
        self.insert_batch(table, records)
    }

    /// Snapshot of a table's rows
    pub fn scan(&self, table: &str) -> Result<Vec<Record>, StorageError> {
        self.tables
            .get(table)
            .map(|t| t.read().clone())
            .ok_or_else(|| StorageError::TableNotFound(table.to_string()))
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.read().len()).unwrap_or(0)
    }

    /// Approximate bytes held across all tables
    pub fn memory_usage(&self) -> usize {
        self.tables
            .iter()
            .map(|e| approx_records_size(&e.value().read()))
            .sum()
    }

    /// Make the next call of `operation` fail with `kind`
    pub fn fail_next(&self, operation: &str, kind: BackendErrorKind, message: impl Into<String>) {
        self.faults
            .insert(operation.to_string(), (kind, message.into()));
    }

    /// Artificial delay applied before every backend operation
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Apply configured latency and injected faults for one backend call
    pub(crate) async fn enter(&self, operation: &str, entity: &str) -> Result<(), BackendError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        match self.faults.remove(operation) {
            Some((_, (kind, message))) => Err(BackendError::new(operation, entity, kind, message)),
            None => Ok(()),
        }
    }

    pub fn begin(&self) -> TransactionId {
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        let snapshot = self
            .tables
            .iter()
            .map(|e| (e.key().clone(), e.value().read().clone()))
            .collect();
        self.transactions.lock().insert(id, snapshot);
        tracing::debug!("Began transaction {}", id);
        TransactionId(id)
    }

    pub fn commit(&self, tx: TransactionId) -> Result<(), StorageError> {
        self.transactions
            .lock()
            .remove(&tx.0)
            .map(|_| ())
            .ok_or(StorageError::UnknownTransaction(tx.0))
    }

    /// Restore every table to its state at `begin`; tables created since are dropped
    pub fn rollback(&self, tx: TransactionId) -> Result<(), StorageError> {
        let snapshot = self
            .transactions
            .lock()
            .remove(&tx.0)
            .ok_or(StorageError::UnknownTransaction(tx.0))?;
        self.tables.retain(|name, _| snapshot.contains_key(name));
        for (name, rows) in snapshot {
            *self.get_or_create_table(&name).write() = rows;
        }
        tracing::debug!("Rolled back transaction {}", tx.0);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Transaction {0} is not open")]
    UnknownTransaction(u64),
}

impl StorageError {
    pub(crate) fn into_backend(self, operation: &str, entity: &str) -> BackendError {
        let kind = match self {
            StorageError::TableNotFound(_) => BackendErrorKind::Other,
            StorageError::UnknownTransaction(_) => BackendErrorKind::Constraint,
        };
        BackendError::new(operation, entity, kind, self.to_string())
    }
}
