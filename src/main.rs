//! Polyquery demo runner
//!
//! Run with: cargo run -- [descriptor.json] [entity]
//!
//! Seeds an in-memory store with orders, customers and addresses, then runs
//! the descriptor through both the relational and the document executor and
//! prints both results.
//!
//! Environment variables:
//! - POLYQUERY_CONFIG: JSON config file (otherwise POLYQUERY_* variables are read)
//! - RUST_LOG: Log level (default: polyquery=info)

use polyquery::data::DataType;
use polyquery::execution::{DocumentExecutor, QueryExecutor, QueryRequest, RelationalExecutor};
use polyquery::query::{QueryDescriptor, ResultCache, SortDirection};
use polyquery::schema::{EntitySchema, FieldDef, RelationCatalog};
use polyquery::storage::{MemoryDocumentBackend, MemoryRelationalBackend, MemoryStore};
use polyquery::{EngineConfig, QueryError};
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const STATUSES: &[&str] = &["ACTIVE", "PENDING", "SHIPPED", "CANCELLED"];
const CITIES: &[&str] = &["Lyon", "Porto", "Leeds", "Graz"];

fn seed(store: &MemoryStore) {
    store.define(
        EntitySchema::new("orders")
            .with_field(FieldDef::scalar("status", DataType::String))
            .with_field(FieldDef::scalar("amount", DataType::Float64))
            .with_field(FieldDef::reference("customer", "customers")),
    );
    store.define(
        EntitySchema::new("customers")
            .with_field(FieldDef::scalar("name", DataType::String))
            .with_field(FieldDef::reference("address", "addresses")),
    );
    store.define(EntitySchema::new("addresses"));

    let addresses: Vec<_> = CITIES
        .iter()
        .enumerate()
        .map(|(i, city)| json!({"id": 100 + i, "city": city}))
        .collect();
    store.insert_json("addresses", &addresses);

    let customers: Vec<_> = (0..8)
        .map(|i| json!({"id": 10 + i, "name": format!("customer-{}", i), "address": 100 + i % CITIES.len()}))
        .collect();
    store.insert_json("customers", &customers);

    let orders: Vec<_> = (1..=40)
        .map(|i| {
            json!({
                "id": i,
                "status": STATUSES[i % STATUSES.len()],
                "amount": (i * 37 % 500) as f64 + 0.5,
                "customer": 10 + i % 8,
            })
        })
        .collect();
    store.insert_json("orders", &orders);
}

fn default_descriptor() -> QueryDescriptor {
    QueryDescriptor::new()
        .with_condition("status", "ACTIVE")
        .with_sort("amount", SortDirection::Desc)
        .with_relations(["customer.address"])
        .with_pagination(1, 5)
}

fn load_config() -> Result<EngineConfig, QueryError> {
    match std::env::var("POLYQUERY_CONFIG") {
        Ok(path) => Ok(EngineConfig::from_file(path)?),
        Err(_) => Ok(EngineConfig::from_env()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "polyquery=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let descriptor = match args.next() {
        Some(path) => QueryDescriptor::from_json_str(&std::fs::read_to_string(path)?)?,
        None => default_descriptor(),
    };
    let entity = args.next().unwrap_or_else(|| "orders".to_string());

    let config = load_config()?;
    tracing::info!("Polyquery configuration:");
    tracing::info!("  Cache TTL: {}s", config.cache_ttl_secs);
    tracing::info!(
        "  Thresholds: {} / {} / {}",
        config.thresholds.memory,
        config.thresholds.hybrid,
        config.thresholds.streaming
    );
    tracing::info!("  Max partitions: {}", config.max_partitions);

    let store = Arc::new(MemoryStore::new());
    seed(&store);
    let catalog = Arc::new(
        RelationCatalog::new(store.schemas().clone()).with_reserved(config.reserved_fields.clone()),
    );

    let relational = RelationalExecutor::with_config(
        Arc::new(MemoryRelationalBackend::new(Arc::clone(&store))),
        Arc::clone(&catalog),
        config.clone(),
    );
    let document = DocumentExecutor::with_config(
        Arc::new(MemoryDocumentBackend::new(Arc::clone(&store))),
        catalog,
        Arc::new(ResultCache::with_config(&config)),
        config,
    );

    let request = QueryRequest::new(entity, descriptor);
    let from_relational = relational.find_paginated(&request).await?;
    let from_document = document.find_paginated(&request).await?;

    println!("relational:\n{}", serde_json::to_string_pretty(&from_relational)?);
    println!("document:\n{}", serde_json::to_string_pretty(&from_document)?);
    if from_relational.items != from_document.items {
        tracing::warn!("Backends returned different items");
    }
    Ok(())
}
