use polyquery::data::{Record, Value};
use polyquery::execution::{DocumentExecutor, QueryExecutor, QueryRequest};
use polyquery::query::{AggregateOp, AggregationSpec, QueryDescriptor, ResultCache, SortDirection, Strategy};
use polyquery::schema::RelationCatalog;
use polyquery::storage::{HashPartitioner, MemoryDocumentBackend, MemoryStore};
use polyquery::EngineConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATUSES: &[&str] = &["ACTIVE", "PENDING", "SHIPPED", "CANCELLED"];
const REGIONS: &[&str] = &["EU", "US", "APAC", "LATAM", "MEA"];
const STRATEGIES: &[Strategy] = &[
    Strategy::Memory,
    Strategy::Hybrid,
    Strategy::Streaming,
    Strategy::Distributed,
];

fn generate_orders(count: usize, rng: &mut StdRng) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let mut row = Record::new();
            row.insert("id".into(), Value::Int64(i as i64 + 1));
            row.insert(
                "status".into(),
                Value::from(STATUSES[rng.gen_range(0..STATUSES.len())]),
            );
            row.insert(
                "region".into(),
                Value::from(REGIONS[rng.gen_range(0..REGIONS.len())]),
            );
            row.insert("amount".into(), Value::Float64(rng.gen_range(1.0..500.0)));
            row
        })
        .collect()
}

struct BenchmarkStats {
    latencies: Vec<Duration>,
    total: u64,
}

impl BenchmarkStats {
    fn avg_latency(&self) -> Duration {
        let sum: Duration = self.latencies.iter().sum();
        sum / self.latencies.len().max(1) as u32
    }

    fn percentile(&self, p: usize) -> Duration {
        let mut sorted = self.latencies.clone();
        sorted.sort();
        sorted
            .get(sorted.len() * p / 100)
            .or(sorted.last())
            .copied()
            .unwrap_or_default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    let rows: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(50_000);
    let iterations: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
    let seed: u64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(42);

    println!("Polyquery Benchmark");
    println!("===================");
    println!("Rows:        {}", rows);
    println!("Iterations:  {}", iterations);
    println!("Seed:        {}", seed);
    println!();

    let mut rng = StdRng::seed_from_u64(seed);
    let store = Arc::new(MemoryStore::new());
    let orders = generate_orders(rows, &mut rng);

    let partitioner = HashPartitioner::new();
    let regions: Vec<Value> = orders.iter().map(|o| o["region"].clone()).collect();
    let buckets = partitioner.assign(&regions);
    println!("Region partitions ({}):", partitioner.partitions());
    for (i, bucket) in buckets.iter().enumerate() {
        println!("  #{:<3} {:>8} rows", i, bucket.len());
    }
    println!();

    store.insert_batch("orders", orders);
    let catalog = Arc::new(RelationCatalog::new(store.schemas().clone()));
    let config = EngineConfig::default();

    let descriptors = [
        (
            "filter+page",
            QueryDescriptor::new()
                .with_condition("status", "ACTIVE")
                .with_sort("amount", SortDirection::Desc)
                .with_pagination(3, 50),
        ),
        (
            "group",
            QueryDescriptor::new()
                .with_group_by("region")
                .with_aggregation(AggregationSpec::new(AggregateOp::Sum, "amount").with_alias("revenue"))
                .with_aggregation(
                    AggregationSpec::count_all()
                        .with_alias("active")
                        .with_condition("status", "ACTIVE"),
                ),
        ),
    ];

    for (name, descriptor) in &descriptors {
        for strategy in STRATEGIES {
            print!("{:<12} {:<12} ... ", name, strategy.name());
            let executor = DocumentExecutor::with_config(
                Arc::new(MemoryDocumentBackend::new(Arc::clone(&store))),
                Arc::clone(&catalog),
                Arc::new(ResultCache::with_config(&config)),
                config.clone(),
            );
            let request = QueryRequest::new("orders", descriptor.clone())
                .with_strategy(*strategy)
                .without_cache();

            let mut stats = BenchmarkStats {
                latencies: Vec::with_capacity(iterations),
                total: 0,
            };
            for _ in 0..iterations {
                let start = Instant::now();
                let result = executor.find_paginated(&request).await?;
                stats.latencies.push(start.elapsed());
                stats.total = result.total;
            }

            println!(
                "total={:<8} avg={:?} p50={:?} p99={:?}",
                stats.total,
                stats.avg_latency(),
                stats.percentile(50),
                stats.percentile(99)
            );
        }
        println!();
    }

    println!("Store memory: {:.1} MB", store.memory_usage() as f64 / (1024.0 * 1024.0));
    Ok(())
}
