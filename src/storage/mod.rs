//! In-memory reference backends.
//!
//! Both backends share one [`MemoryStore`], so the same data can be queried
//! through the relational plan evaluator and the pipeline evaluator.

pub mod document;
pub mod engine;
pub mod partitioner;
pub mod populate;
pub mod predicate;
pub mod relational;

pub use document::{run_pipeline, MemoryCursor, MemoryDocumentBackend};
pub use engine::{MemoryStore, StorageError};
pub use partitioner::{partition_of, HashPartitioner};
pub use relational::{evaluate, evaluate_count, MemoryRelationalBackend};

/// Shared fixture: 15 users (ids 1..=12 ACTIVE) and their companies
#[cfg(test)]
pub(crate) fn user_store() -> std::sync::Arc<MemoryStore> {
    use crate::data::DataType;
    use crate::schema::{EntitySchema, FieldDef};
    use serde_json::json;

    let store = MemoryStore::new();
    store.define(
        EntitySchema::new("users")
            .with_field(FieldDef::scalar("status", DataType::String))
            .with_field(FieldDef::scalar("region", DataType::String))
            .with_field(FieldDef::scalar("amount", DataType::Int64))
            .with_field(FieldDef::reference("company", "companies")),
    );
    store.define(EntitySchema::new("companies").with_field(FieldDef::scalar("name", DataType::String)));

    let users: Vec<_> = (1..=15)
        .map(|id| {
            let status = if id <= 12 { "ACTIVE" } else { "INACTIVE" };
            let region = if id <= 5 { "EU" } else { "US" };
            let company = if id % 2 == 0 { 10 } else { 11 };
            json!({
                "id": id,
                "status": status,
                "region": region,
                "amount": id * 10,
                "company": company,
            })
        })
        .collect();
    store.insert_json("users", &users);
    store.insert_json(
        "companies",
        &[json!({"id": 10, "name": "Initech"}), json!({"id": 11, "name": "Hooli"})],
    );
    std::sync::Arc::new(store)
}
