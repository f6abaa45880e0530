//! Relational backend: descriptor compilation into parameterized plans.

pub mod compiler;
pub mod describe;
pub mod plan;

pub use compiler::{CompiledRelational, RelationalCompiler};
pub use describe::{describe, describe_sql};
pub use plan::{
    Clause, ColumnRef, JoinClause, OrderItem, PlanKind, Predicate, ProjectionItem, RelationalPlan,
};
