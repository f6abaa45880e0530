//! Parameterized relational query plans.
//!
//! A plan is an ordered list of clauses. Literal values never appear in a
//! clause; predicates reference positional parameters instead.

use serde::Serialize;
use std::fmt::Write as _;

use crate::data::Value;
use crate::query::descriptor::{AggregateOp, JoinType};
use crate::query::filter::FilterOperator;
use crate::query::aggregates::CONCAT_SEPARATOR;
use crate::schema::PopulateNode;

/// Column reference; `qualifier` is a table or join alias
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

impl ColumnRef {
    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            name: name.into(),
        }
    }

    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
        }
    }

    fn render(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}.{}", quote(q), quote(&self.name)),
            None => quote(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Predicate {
    /// Binary comparison against parameter `param`
    Compare {
        column: ColumnRef,
        op: FilterOperator,
        param: usize,
    },
    InList {
        column: ColumnRef,
        params: Vec<usize>,
        negated: bool,
    },
    Like {
        column: ColumnRef,
        param: usize,
        case_insensitive: bool,
    },
    IsNull {
        column: ColumnRef,
        negated: bool,
    },
    Any(Vec<Predicate>),
    All(Vec<Predicate>),
}

impl Predicate {
    /// Columns referenced by this predicate, in order of appearance
    pub fn columns(&self) -> Vec<&ColumnRef> {
        match self {
            Predicate::Compare { column, .. }
            | Predicate::InList { column, .. }
            | Predicate::Like { column, .. }
            | Predicate::IsNull { column, .. } => vec![column],
            Predicate::Any(items) | Predicate::All(items) => {
                items.iter().flat_map(|p| p.columns()).collect()
            }
        }
    }

    fn render(&self) -> String {
        match self {
            Predicate::Compare { column, op, param } => {
                format!("{} {} ${}", column.render(), op.sql(), param + 1)
            }
            Predicate::InList {
                column,
                params,
                negated,
            } => {
                if params.is_empty() {
                    return if *negated { "1 = 1".into() } else { "1 = 0".into() };
                }
                let list = params
                    .iter()
                    .map(|p| format!("${}", p + 1))
                    .collect::<Vec<_>>()
                    .join(", ");
                let keyword = if *negated { "NOT IN" } else { "IN" };
                format!("{} {} ({})", column.render(), keyword, list)
            }
            Predicate::Like {
                column,
                param,
                case_insensitive,
            } => {
                let keyword = if *case_insensitive { "ILIKE" } else { "LIKE" };
                format!("{} {} ${}", column.render(), keyword, param + 1)
            }
            Predicate::IsNull { column, negated } => {
                let keyword = if *negated { "IS NOT NULL" } else { "IS NULL" };
                format!("{} {}", column.render(), keyword)
            }
            Predicate::Any(items) => group(items, " OR "),
            Predicate::All(items) => group(items, " AND "),
        }
    }
}

fn group(items: &[Predicate], separator: &str) -> String {
    match items.len() {
        0 => "1 = 1".into(),
        1 => items[0].render(),
        _ => format!(
            "({})",
            items
                .iter()
                .map(Predicate::render)
                .collect::<Vec<_>>()
                .join(separator)
        ),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ProjectionItem {
    Column {
        column: ColumnRef,
        alias: Option<String>,
    },
    /// Every column of a table or join alias
    AllColumns { qualifier: String },
    Aggregate {
        op: AggregateOp,
        column: Option<ColumnRef>,
        alias: String,
        /// Conditional aggregate: only rows matching the predicate contribute
        filter: Option<Predicate>,
    },
    CountAll { alias: String },
}

impl ProjectionItem {
    fn render(&self) -> String {
        match self {
            ProjectionItem::Column { column, alias } => match alias {
                Some(a) => format!("{} AS {}", column.render(), quote(a)),
                None => column.render(),
            },
            ProjectionItem::AllColumns { qualifier } => format!("{}.*", quote(qualifier)),
            ProjectionItem::Aggregate {
                op,
                column,
                alias,
                filter,
            } => format!("{} AS {}", render_aggregate(*op, column.as_ref(), filter.as_ref()), quote(alias)),
            ProjectionItem::CountAll { alias } => format!("COUNT(*) AS {}", quote(alias)),
        }
    }
}

fn render_aggregate(op: AggregateOp, column: Option<&ColumnRef>, filter: Option<&Predicate>) -> String {
    let operand = column.map(ColumnRef::render);
    match op {
        AggregateOp::Count => match (filter, operand) {
            (Some(f), _) => format!("COUNT(CASE WHEN {} THEN 1 END)", f.render()),
            (None, Some(col)) => format!("COUNT({})", col),
            (None, None) => "COUNT(*)".to_string(),
        },
        AggregateOp::Concat => {
            let text = format!("CAST({} AS TEXT)", operand.unwrap_or_else(|| "NULL".into()));
            let value = match filter {
                Some(f) => format!("CASE WHEN {} THEN {} END", f.render(), text),
                None => text,
            };
            format!("STRING_AGG({}, '{}')", value, CONCAT_SEPARATOR)
        }
        _ => {
            let name = match op {
                AggregateOp::Sum => "SUM",
                AggregateOp::Avg => "AVG",
                AggregateOp::Min => "MIN",
                _ => "MAX",
            };
            let operand = operand.unwrap_or_else(|| "NULL".into());
            match filter {
                Some(f) => format!("{}(CASE WHEN {} THEN {} END)", name, f.render(), operand),
                None => format!("{}({})", name, operand),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub source: String,
    pub alias: String,
    /// Column on the already-joined side
    pub left: ColumnRef,
    /// Column on the joined source
    pub right: ColumnRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OrderItem {
    pub column: ColumnRef,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Clause {
    Select(Vec<ProjectionItem>),
    From { table: String },
    Join(JoinClause),
    /// Primary filter clause
    Where(Predicate),
    /// Conjunctive filter appended after the primary one
    AndWhere(Predicate),
    GroupBy(Vec<ColumnRef>),
    OrderBy(Vec<OrderItem>),
    Skip(u64),
    Take(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlanKind {
    Data,
    Count,
}

/// Compiled relational plan with its bound parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationalPlan {
    pub kind: PlanKind,
    pub entity: String,
    pub clauses: Vec<Clause>,
    pub params: Vec<Value>,
    /// Relations loaded onto returned rows after the fetch
    pub populate: Vec<PopulateNode>,
}

impl RelationalPlan {
    pub fn projection(&self) -> &[ProjectionItem] {
        self.clauses
            .iter()
            .find_map(|c| match c {
                Clause::Select(items) => Some(items.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn joins(&self) -> Vec<&JoinClause> {
        self.clauses
            .iter()
            .filter_map(|c| match c {
                Clause::Join(j) => Some(j),
                _ => None,
            })
            .collect()
    }

    /// WHERE and AND predicates in application order
    pub fn predicates(&self) -> Vec<&Predicate> {
        self.clauses
            .iter()
            .filter_map(|c| match c {
                Clause::Where(p) | Clause::AndWhere(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn group_by(&self) -> &[ColumnRef] {
        self.clauses
            .iter()
            .find_map(|c| match c {
                Clause::GroupBy(cols) => Some(cols.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    /// True for aggregating plans, including aggregates over all rows (empty GROUP BY)
    pub fn is_grouped(&self) -> bool {
        self.clauses.iter().any(|c| matches!(c, Clause::GroupBy(_)))
    }

    pub fn order_by(&self) -> &[OrderItem] {
        self.clauses
            .iter()
            .find_map(|c| match c {
                Clause::OrderBy(items) => Some(items.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    pub fn skip(&self) -> Option<u64> {
        self.clauses.iter().find_map(|c| match c {
            Clause::Skip(n) => Some(*n),
            _ => None,
        })
    }

    pub fn take(&self) -> Option<u64> {
        self.clauses.iter().find_map(|c| match c {
            Clause::Take(n) => Some(*n),
            _ => None,
        })
    }

    pub fn param(&self, index: usize) -> &Value {
        self.params.get(index).unwrap_or(&Value::Null)
    }

    /// Render as PostgreSQL-flavored SQL with `$n` placeholders
    pub fn to_sql(&self) -> String {
        let mut body = String::new();
        let _ = write!(body, "FROM {}", quote(&self.entity));
        for join in self.joins() {
            let _ = write!(
                body,
                " {} {} AS {} ON {} = {}",
                join.join_type.keyword(),
                quote(&join.source),
                quote(&join.alias),
                join.left.render(),
                join.right.render()
            );
        }
        for clause in &self.clauses {
            match clause {
                Clause::Where(p) => {
                    let _ = write!(body, " WHERE {}", p.render());
                }
                Clause::AndWhere(p) => {
                    let _ = write!(body, " AND {}", p.render());
                }
                _ => {}
            }
        }
        let group_by = self.group_by();
        if !group_by.is_empty() {
            let cols = group_by.iter().map(ColumnRef::render).collect::<Vec<_>>();
            let _ = write!(body, " GROUP BY {}", cols.join(", "));
        }

        if self.kind == PlanKind::Count && self.is_grouped() {
            // Total is the number of groups; an aggregate without GROUP BY yields one
            return format!(
                "SELECT COUNT(*) AS \"total\" FROM (SELECT COUNT(*) AS \"rows\" {}) AS \"grouped\"",
                body
            );
        }

        let projection = self.projection();
        let select = if projection.is_empty() {
            format!("{}.*", quote(&self.entity))
        } else {
            projection
                .iter()
                .map(ProjectionItem::render)
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {} {}", select, body);
        let order_by = self.order_by();
        if !order_by.is_empty() {
            let items = order_by
                .iter()
                .map(|o| {
                    format!(
                        "{} {}",
                        o.column.render(),
                        if o.descending { "DESC" } else { "ASC" }
                    )
                })
                .collect::<Vec<_>>();
            let _ = write!(sql, " ORDER BY {}", items.join(", "));
        }
        if let Some(take) = self.take() {
            let _ = write!(sql, " LIMIT {}", take);
        }
        if let Some(skip) = self.skip() {
            let _ = write!(sql, " OFFSET {}", skip);
        }
        sql
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_conditional_count() {
        let filter = Predicate::Compare {
            column: ColumnRef::qualified("users", "status"),
            op: FilterOperator::Eq,
            param: 0,
        };
        let rendered = render_aggregate(AggregateOp::Count, None, Some(&filter));
        assert_eq!(rendered, "COUNT(CASE WHEN \"users\".\"status\" = $1 THEN 1 END)");
    }

    #[test]
    fn test_render_empty_in_list() {
        let p = Predicate::InList {
            column: ColumnRef::bare("id"),
            params: vec![],
            negated: false,
        };
        assert_eq!(p.render(), "1 = 0");
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }
}
