use sqlparser::ast::{
    BinaryOperator, Expr, Join, JoinConstraint, JoinOperator, OrderByExpr, Query, Select, SetExpr,
    Statement, TableFactor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::plan::RelationalPlan;
use crate::query::descriptor::{SortDirection, SortField};
use crate::query::{DescribeError, JoinDescription, PlanDescription};

/// Recover filter, join and sort fields from a plan's rendered SQL
pub fn describe(plan: &RelationalPlan) -> Result<PlanDescription, DescribeError> {
    describe_sql(&plan.to_sql())
}

pub fn describe_sql(sql: &str) -> Result<PlanDescription, DescribeError> {
    let dialect = GenericDialect {};
    let statements = Parser::parse_sql(&dialect, sql)?;
    let query = match statements.as_slice() {
        [Statement::Query(query)] => query,
        [] => return Err(DescribeError::Malformed("empty statement".into())),
        _ => return Err(DescribeError::Unsupported("expected a single SELECT".into())),
    };

    let mut description = PlanDescription::default();
    describe_query(query, &mut description)?;
    Ok(description)
}

fn describe_query(query: &Query, out: &mut PlanDescription) -> Result<(), DescribeError> {
    let select = match &*query.body {
        SetExpr::Select(select) => select,
        _ => return Err(DescribeError::Unsupported("only SELECT is described".into())),
    };

    let from = select
        .from
        .first()
        .ok_or_else(|| DescribeError::Malformed("missing FROM".into()))?;
    let base = match &from.relation {
        TableFactor::Table { name, .. } => name
            .0
            .iter()
            .map(|i| i.value.clone())
            .collect::<Vec<_>>()
            .join("."),
        // Grouped count plans wrap the filtered query
        TableFactor::Derived { subquery, .. } => return describe_query(subquery, out),
        _ => return Err(DescribeError::Unsupported("table expression".into())),
    };

    for join in &from.joins {
        out.joins.push(describe_join(&base, join)?);
    }
    describe_selection(&base, select, out);
    describe_order(&base, &query.order_by, out);
    Ok(())
}

fn describe_join(base: &str, join: &Join) -> Result<JoinDescription, DescribeError> {
    let (source, alias) = match &join.relation {
        TableFactor::Table { name, alias, .. } => {
            let source = name.to_string().trim_matches('"').to_string();
            let alias = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| source.clone());
            (source, alias)
        }
        _ => return Err(DescribeError::Unsupported("joined table expression".into())),
    };

    let constraint = match &join.join_operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => c,
        _ => return Err(DescribeError::Unsupported("join operator".into())),
    };
    let (left, right) = match constraint {
        JoinConstraint::On(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) => (left, right),
        _ => return Err(DescribeError::Malformed(format!("join on '{}' lacks an equality", alias))),
    };

    let local_field = field_name(base, left)
        .ok_or_else(|| DescribeError::Malformed("join local side is not a column".into()))?;
    let foreign_field = field_name(&alias, right)
        .ok_or_else(|| DescribeError::Malformed("join foreign side is not a column".into()))?;

    Ok(JoinDescription {
        source,
        alias,
        local_field,
        foreign_field,
    })
}

fn describe_selection(base: &str, select: &Select, out: &mut PlanDescription) {
    if let Some(selection) = &select.selection {
        collect_filter_fields(base, selection, &mut out.filter_fields);
    }
}

fn collect_filter_fields(base: &str, expr: &Expr, fields: &mut Vec<String>) {
    let column = match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And | BinaryOperator::Or,
            right,
        } => {
            collect_filter_fields(base, left, fields);
            collect_filter_fields(base, right, fields);
            return;
        }
        Expr::Nested(inner) => {
            collect_filter_fields(base, inner, fields);
            return;
        }
        Expr::BinaryOp { left, .. } => left,
        Expr::Like { expr, .. }
        | Expr::ILike { expr, .. }
        | Expr::InList { expr, .. }
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr) => expr,
        _ => return,
    };
    if let Some(field) = field_name(base, column) {
        if !fields.contains(&field) {
            fields.push(field);
        }
    }
}

fn describe_order(base: &str, order_by: &[OrderByExpr], out: &mut PlanDescription) {
    for item in order_by {
        if let Some(field) = field_name(base, &item.expr) {
            out.sort.push(SortField {
                field,
                direction: if item.asc == Some(false) {
                    SortDirection::Desc
                } else {
                    SortDirection::Asc
                },
            });
        }
    }
}

/// Dotted field for a column; the base table qualifier is dropped
fn field_name(base: &str, expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => {
            let parts: Vec<&str> = idents.iter().map(|i| i.value.as_str()).collect();
            match parts.split_first() {
                Some((first, rest)) if *first == base && !rest.is_empty() => Some(rest.join(".")),
                _ => Some(parts.join(".")),
            }
        }
        Expr::Nested(inner) => field_name(base, inner),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::descriptor::{
        AggregateOp, AggregationSpec, JoinSpec, OperatorSet, QueryDescriptor,
    };
    use crate::query::QueryContext;
    use crate::relational::RelationalCompiler;

    #[test]
    fn test_round_trip_recovers_fields() {
        let d = QueryDescriptor::new()
            .with_condition("status", "ACTIVE")
            .with_condition("age", OperatorSet::new().gte(18).lt(65))
            .with_condition("company.country", "NZ")
            .with_join(JoinSpec::new("companies", "companyId", "id").with_alias("company"))
            .with_sort("name", SortDirection::Asc)
            .with_sort("createdAt", SortDirection::Desc)
            .with_pagination(2, 5);
        let ctx = QueryContext::new("users", "id");
        let compiled = RelationalCompiler::new(&ctx).compile(&d);

        let data = describe(&compiled.data).unwrap();
        assert_eq!(data.filter_fields, vec!["age", "company.country", "status"]);
        assert_eq!(
            data.joins,
            vec![JoinDescription {
                source: "companies".into(),
                alias: "company".into(),
                local_field: "companyId".into(),
                foreign_field: "id".into(),
            }]
        );
        let sort: Vec<(&str, SortDirection)> =
            data.sort.iter().map(|s| (s.field.as_str(), s.direction)).collect();
        assert_eq!(
            sort,
            vec![("name", SortDirection::Asc), ("createdAt", SortDirection::Desc)]
        );

        let count = describe(&compiled.count).unwrap();
        assert_eq!(count.filter_fields, data.filter_fields);
        assert_eq!(count.joins, data.joins);
        assert!(count.sort.is_empty());
    }

    #[test]
    fn test_grouped_count_plan_is_described() {
        let d = QueryDescriptor::new()
            .with_condition("status", OperatorSet::new().any_of(vec!["A".into(), "B".into()]))
            .with_aggregation(AggregationSpec::new(AggregateOp::Avg, "age"))
            .with_group_by("region");
        let ctx = QueryContext::new("users", "id");
        let compiled = RelationalCompiler::new(&ctx).compile(&d);

        let count = describe(&compiled.count).unwrap();
        assert_eq!(count.filter_fields, vec!["status"]);

        let data = describe(&compiled.data).unwrap();
        assert_eq!(data.sort[0].field, "region");
        assert_eq!(data.sort[0].direction, SortDirection::Asc);
    }

    #[test]
    fn test_rejects_non_select() {
        assert!(matches!(
            describe_sql("DELETE FROM users"),
            Err(DescribeError::Unsupported(_))
        ));
        assert!(describe_sql("SELECT * FROM").is_err());
    }
}
