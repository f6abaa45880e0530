//! Document backend: descriptor compilation into aggregation pipelines.

pub mod compiler;
pub mod describe;
pub mod pipeline;

pub use compiler::{DocumentCompiler, TOTAL_FIELD};
pub use describe::{describe, describe_json};
pub use pipeline::{GroupAccumulator, GroupKey, MatchExpr, Pipeline, PipelineOptions, Stage};
