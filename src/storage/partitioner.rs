//! Hash partitioning for DISTRIBUTED execution
//!
//! A value always lands in the same partition for a given partition count, so
//! rows sharing a partition key (and therefore a group) never span partitions.

use crate::data::Value;

/// Bucket of `value` among `partitions`; `Null` hashes like any other value
pub fn partition_of(value: &Value, partitions: usize) -> usize {
    let partitions = partitions.max(1);
    (fxhash::hash64(value) % partitions as u64) as usize
}

/// Partitioner sized to the available cores
#[derive(Debug, Clone, Copy)]
pub struct HashPartitioner {
    partitions: usize,
}

impl HashPartitioner {
    /// One partition per CPU core
    pub fn new() -> Self {
        Self::with_partitions(num_cpus::get())
    }

    /// A specific partition count, capped by the core count
    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            partitions: partitions.clamp(1, num_cpus::get().max(1)),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn partition_of(&self, value: &Value) -> usize {
        partition_of(value, self.partitions)
    }

    /// Split values into per-partition index lists
    pub fn assign(&self, values: &[Value]) -> Vec<Vec<usize>> {
        let mut buckets = vec![Vec::new(); self.partitions];
        for (i, value) in values.iter().enumerate() {
            buckets[self.partition_of(value)].push(i);
        }
        buckets
    }
}

impl Default for HashPartitioner {
    fn default() -> Self {
        Self::new()
    }
}
