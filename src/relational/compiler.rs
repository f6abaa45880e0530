use std::collections::HashSet;

use super::plan::{
    Clause, ColumnRef, JoinClause, OrderItem, PlanKind, Predicate, ProjectionItem, RelationalPlan,
};
use crate::data::Value;
use crate::query::descriptor::{AggregateOp, AggregationSpec, QueryDescriptor};
use crate::query::filter::{conditions_to_filters, merge_conditions, FieldFilter, FilterOperator};
use crate::query::search::{like_pattern, plan_search, MatchStrategy, SearchPlan};
use crate::query::QueryContext;

/// Data plan plus the mirrored count plan
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRelational {
    pub data: RelationalPlan,
    pub count: RelationalPlan,
    pub search: Option<SearchPlan>,
}

/// Compiles descriptors into parameterized relational plans
pub struct RelationalCompiler<'a> {
    ctx: &'a QueryContext,
}

/// Parameter list under construction
#[derive(Default)]
struct Params(Vec<Value>);

impl Params {
    fn bind(&mut self, value: Value) -> usize {
        self.0.push(value);
        self.0.len() - 1
    }
}

impl<'a> RelationalCompiler<'a> {
    pub fn new(ctx: &'a QueryContext) -> Self {
        Self { ctx }
    }

    pub fn compile(&self, descriptor: &QueryDescriptor) -> CompiledRelational {
        let entity = self.ctx.entity.as_str();
        let mut params = Params::default();

        // Joins first so alias-qualified fields resolve against them
        let joins = self.compile_joins(descriptor);
        let aliases: HashSet<&str> = joins.iter().map(|j| j.alias.as_str()).collect();
        let resolve = |field: &str| column_ref(entity, &aliases, field);

        let filters = merge_conditions(&self.ctx.backend_conditions, &descriptor.conditions);
        let mut predicates: Vec<Predicate> = filters
            .iter()
            .map(|f| filter_predicate(f, &resolve, &mut params))
            .collect();

        let search = plan_search(descriptor.search.as_ref(), &self.ctx.search_config);
        if let Some(plan) = &search {
            predicates.push(search_predicate(plan, &resolve, &mut params));
        }
        let filter_param_count = params.0.len();

        let mut shared: Vec<Clause> = vec![Clause::From {
            table: entity.to_string(),
        }];
        shared.extend(joins.iter().cloned().map(Clause::Join));
        for (i, predicate) in predicates.into_iter().enumerate() {
            shared.push(if i == 0 {
                Clause::Where(predicate)
            } else {
                Clause::AndWhere(predicate)
            });
        }
        let group_by: Vec<ColumnRef> = descriptor.group_by.iter().map(|f| resolve(f.as_str())).collect();
        if descriptor.has_grouping() {
            shared.push(Clause::GroupBy(group_by.clone()));
        }

        // Count plan: same filters and joins, no projection, no paging
        let count_params = params.0[..filter_param_count].to_vec();
        let mut count_clauses = vec![Clause::Select(vec![ProjectionItem::CountAll {
            alias: "total".to_string(),
        }])];
        count_clauses.extend(shared.iter().cloned());

        let projection = self.compile_projection(descriptor, &joins, &group_by, &resolve, &mut params);
        let mut data_clauses = vec![Clause::Select(projection)];
        data_clauses.extend(shared);

        let order = self.compile_order(descriptor, &resolve);
        if !order.is_empty() {
            data_clauses.push(Clause::OrderBy(order));
        }
        if let Some(pagination) = &descriptor.pagination {
            data_clauses.push(Clause::Skip(pagination.skip()));
            data_clauses.push(Clause::Take(pagination.limit));
        }

        tracing::debug!(
            "Compiled relational plan for '{}': {} clauses, {} params",
            entity,
            data_clauses.len(),
            params.0.len()
        );

        CompiledRelational {
            data: RelationalPlan {
                kind: PlanKind::Data,
                entity: entity.to_string(),
                clauses: data_clauses,
                params: params.0,
                populate: self.ctx.populate.clone(),
            },
            count: RelationalPlan {
                kind: PlanKind::Count,
                entity: entity.to_string(),
                clauses: count_clauses,
                params: count_params,
                populate: Vec::new(),
            },
            search,
        }
    }

    fn compile_joins(&self, descriptor: &QueryDescriptor) -> Vec<JoinClause> {
        let entity = self.ctx.entity.as_str();
        let mut joins: Vec<JoinClause> = Vec::new();
        for spec in &descriptor.joins {
            if let Some(defect) = spec.defect() {
                tracing::warn!("Skipping join on '{}': {}", entity, defect);
                continue;
            }
            let alias = spec.alias_name().to_string();
            if alias == entity || joins.iter().any(|j| j.alias == alias) {
                tracing::warn!("Skipping join on '{}': duplicate alias '{}'", entity, alias);
                continue;
            }
            let known: HashSet<&str> = joins.iter().map(|j| j.alias.as_str()).collect();
            let left = column_ref(entity, &known, &spec.local_field);
            joins.push(JoinClause {
                join_type: spec.join_type,
                source: spec.source.clone(),
                right: ColumnRef::qualified(alias.clone(), spec.foreign_field.clone()),
                alias,
                left,
            });
        }
        joins
    }

    fn compile_projection(
        &self,
        descriptor: &QueryDescriptor,
        joins: &[JoinClause],
        group_by: &[ColumnRef],
        resolve: &impl Fn(&str) -> ColumnRef,
        params: &mut Params,
    ) -> Vec<ProjectionItem> {
        let entity = self.ctx.entity.as_str();
        let selected = |name: &str| descriptor.select.is_empty() || descriptor.select.iter().any(|s| s == name);

        if descriptor.has_grouping() {
            let mut items: Vec<ProjectionItem> = descriptor
                .group_by
                .iter()
                .zip(group_by)
                .filter(|(field, _)| selected(field.as_str()))
                .map(|(field, column)| ProjectionItem::Column {
                    column: column.clone(),
                    alias: Some(field.clone()),
                })
                .collect();
            for spec in &descriptor.aggregations {
                let alias = spec.output_name();
                if !selected(alias.as_str()) {
                    continue;
                }
                if let Some(item) = aggregate_item(spec, alias, resolve, params) {
                    items.push(item);
                }
            }
            return items;
        }

        if descriptor.select.is_empty() {
            // Joined records ride along under their alias
            let mut items = vec![ProjectionItem::AllColumns {
                qualifier: entity.to_string(),
            }];
            items.extend(joins.iter().map(|j| ProjectionItem::AllColumns {
                qualifier: j.alias.clone(),
            }));
            return items;
        }
        descriptor
            .select
            .iter()
            .map(|field| ProjectionItem::Column {
                column: resolve(field.as_str()),
                alias: Some(field.clone()),
            })
            .collect()
    }

    fn compile_order(
        &self,
        descriptor: &QueryDescriptor,
        resolve: &impl Fn(&str) -> ColumnRef,
    ) -> Vec<OrderItem> {
        let outputs: HashSet<String> = descriptor
            .aggregations
            .iter()
            .map(AggregationSpec::output_name)
            .collect();

        if !descriptor.sort.is_empty() {
            return descriptor
                .sort
                .fields()
                .iter()
                .map(|s| OrderItem {
                    column: if outputs.contains(&s.field) {
                        ColumnRef::bare(s.field.clone())
                    } else {
                        resolve(s.field.as_str())
                    },
                    descending: s.direction.is_descending(),
                })
                .collect();
        }

        if descriptor.has_grouping() {
            // Grouped rows have no primary key; order by the group key
            return descriptor
                .group_by
                .iter()
                .map(|f| OrderItem {
                    column: resolve(f.as_str()),
                    descending: false,
                })
                .collect();
        }

        vec![OrderItem {
            column: ColumnRef::qualified(self.ctx.entity.clone(), self.ctx.primary_key.clone()),
            descending: true,
        }]
    }
}

/// Qualify a field: `alias.rest` when the root names a join alias, else the base table
fn column_ref(entity: &str, aliases: &HashSet<&str>, field: &str) -> ColumnRef {
    if let Some((root, rest)) = field.split_once('.') {
        if aliases.contains(root) {
            return ColumnRef::qualified(root, rest);
        }
    }
    ColumnRef::qualified(entity, field)
}

fn filter_predicate(
    filter: &FieldFilter,
    resolve: &impl Fn(&str) -> ColumnRef,
    params: &mut Params,
) -> Predicate {
    let column = resolve(filter.field.as_str());
    match filter.operator {
        FilterOperator::In | FilterOperator::NotIn => {
            let values = match &filter.value {
                Value::Array(values) => values.clone(),
                other => vec![other.clone()],
            };
            Predicate::InList {
                column,
                params: values.into_iter().map(|v| params.bind(v)).collect(),
                negated: filter.operator == FilterOperator::NotIn,
            }
        }
        FilterOperator::Like => Predicate::Like {
            column,
            param: params.bind(filter.value.clone()),
            case_insensitive: false,
        },
        FilterOperator::IsNull => Predicate::IsNull {
            column,
            negated: false,
        },
        FilterOperator::IsNotNull => Predicate::IsNull {
            column,
            negated: true,
        },
        op => Predicate::Compare {
            column,
            op,
            param: params.bind(filter.value.clone()),
        },
    }
}

fn search_predicate(
    plan: &SearchPlan,
    resolve: &impl Fn(&str) -> ColumnRef,
    params: &mut Params,
) -> Predicate {
    let alternatives = plan
        .matches
        .iter()
        .map(|m| {
            let column = resolve(m.field.as_str());
            match m.strategy {
                MatchStrategy::Exact => Predicate::Compare {
                    column,
                    op: FilterOperator::Eq,
                    param: params.bind(Value::from(plan.term.as_str())),
                },
                strategy => Predicate::Like {
                    column,
                    param: params.bind(Value::String(like_pattern(&plan.term, strategy))),
                    case_insensitive: true,
                },
            }
        })
        .collect();
    Predicate::Any(alternatives)
}

fn aggregate_item(
    spec: &AggregationSpec,
    alias: String,
    resolve: &impl Fn(&str) -> ColumnRef,
    params: &mut Params,
) -> Option<ProjectionItem> {
    let column = spec.column().map(|c| resolve(c));
    if column.is_none() && spec.operation != AggregateOp::Count {
        tracing::warn!(
            "Skipping aggregation '{}': {} requires a field",
            alias,
            spec.operation.name()
        );
        return None;
    }
    let filter = spec.conditions.as_ref().and_then(|conditions| {
        let predicates: Vec<Predicate> = conditions_to_filters(conditions)
            .iter()
            .map(|f| filter_predicate(f, resolve, params))
            .collect();
        match predicates.len() {
            0 => None,
            1 => predicates.into_iter().next(),
            _ => Some(Predicate::All(predicates)),
        }
    });
    Some(ProjectionItem::Aggregate {
        op: spec.operation,
        column,
        alias,
        filter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::descriptor::{JoinSpec, JoinType, OperatorSet, SortDirection};
    use crate::query::search::SearchConfig;

    fn ctx() -> QueryContext {
        QueryContext::new("users", "id")
    }

    #[test]
    fn test_conditions_become_where_then_and() {
        let d = QueryDescriptor::new()
            .with_condition("status", "ACTIVE")
            .with_condition("age", OperatorSet::new().gte(18));
        let ctx = ctx();
        let compiled = RelationalCompiler::new(&ctx).compile(&d);

        let where_clauses: Vec<&Clause> = compiled
            .data
            .clauses
            .iter()
            .filter(|c| matches!(c, Clause::Where(_) | Clause::AndWhere(_)))
            .collect();
        assert_eq!(where_clauses.len(), 2);
        assert!(matches!(where_clauses[0], Clause::Where(_)));
        assert!(matches!(where_clauses[1], Clause::AndWhere(_)));
        assert_eq!(compiled.data.params, vec![Value::Int64(18), Value::from("ACTIVE")]);

        let sql = compiled.data.to_sql();
        assert!(sql.contains("WHERE \"users\".\"age\" >= $1 AND \"users\".\"status\" = $2"));
        assert!(!sql.contains("ACTIVE"));
    }

    #[test]
    fn test_default_order_and_paging() {
        let d = QueryDescriptor::new().with_pagination(3, 10);
        let ctx = ctx();
        let compiled = RelationalCompiler::new(&ctx).compile(&d);

        assert_eq!(compiled.data.skip(), Some(20));
        assert_eq!(compiled.data.take(), Some(10));
        assert_eq!(
            compiled.data.order_by(),
            &[OrderItem {
                column: ColumnRef::qualified("users", "id"),
                descending: true
            }]
        );
        assert!(compiled.data.to_sql().ends_with("ORDER BY \"users\".\"id\" DESC LIMIT 10 OFFSET 20"));
    }

    #[test]
    fn test_count_plan_mirrors_filters() {
        let d = QueryDescriptor::new()
            .with_condition("status", "ACTIVE")
            .with_join(JoinSpec::new("companies", "companyId", "id").with_alias("company"))
            .with_search("ada", ["name"])
            .with_select(["name"])
            .with_pagination(2, 5);
        let ctx = ctx();
        let compiled = RelationalCompiler::new(&ctx).compile(&d);

        assert_eq!(compiled.data.predicates(), compiled.count.predicates());
        assert_eq!(compiled.data.joins(), compiled.count.joins());
        assert_eq!(compiled.count.skip(), None);
        assert_eq!(compiled.count.take(), None);
        assert!(compiled.count.order_by().is_empty());
        assert_eq!(
            compiled.count.projection(),
            &[ProjectionItem::CountAll { alias: "total".into() }]
        );
        assert_eq!(compiled.count.params, compiled.data.params);
    }

    #[test]
    fn test_join_types_and_projection() {
        let d = QueryDescriptor::new()
            .with_join(JoinSpec::new("companies", "companyId", "id").with_alias("company"))
            .with_join(
                JoinSpec::new("countries", "company.countryId", "id").with_type(JoinType::Inner),
            )
            .with_join(JoinSpec::new("", "x", "y"));
        let ctx = ctx();
        let compiled = RelationalCompiler::new(&ctx).compile(&d);

        let joins = compiled.data.joins();
        assert_eq!(joins.len(), 2);
        assert_eq!(joins[0].join_type, JoinType::Left);
        assert_eq!(joins[1].join_type, JoinType::Inner);
        assert_eq!(joins[1].left, ColumnRef::qualified("company", "countryId"));
        assert_eq!(joins[1].alias, "countries");

        let sql = compiled.data.to_sql();
        assert!(sql.starts_with("SELECT \"users\".*, \"company\".*, \"countries\".* FROM \"users\""));
        assert!(sql.contains("INNER JOIN \"countries\" AS \"countries\" ON \"company\".\"countryId\" = \"countries\".\"id\""));
    }

    #[test]
    fn test_conditional_aggregation_and_group_by() {
        let d = QueryDescriptor::new()
            .with_aggregation(
                AggregationSpec::new(AggregateOp::Count, "status")
                    .with_alias("active_count")
                    .with_condition("status", "ACTIVE"),
            )
            .with_aggregation(AggregationSpec::new(AggregateOp::Sum, "amount"))
            .with_group_by("region")
            .with_sort("active_count", SortDirection::Desc);
        let ctx = ctx();
        let compiled = RelationalCompiler::new(&ctx).compile(&d);

        let sql = compiled.data.to_sql();
        assert!(sql.contains("COUNT(CASE WHEN \"users\".\"status\" = $1 THEN 1 END) AS \"active_count\""));
        assert!(sql.contains("SUM(\"users\".\"amount\") AS \"sum_amount\""));
        let group_pos = sql.find("GROUP BY").unwrap();
        let order_pos = sql.find("ORDER BY \"active_count\" DESC").unwrap();
        assert!(group_pos < order_pos);

        // Aggregate parameters are not part of the count plan
        assert!(compiled.count.params.is_empty());
        assert!(compiled
            .count
            .to_sql()
            .contains("FROM (SELECT COUNT(*) AS \"rows\" FROM \"users\" GROUP BY"));
    }

    #[test]
    fn test_search_uses_like_patterns() {
        let mut ctx = ctx();
        ctx.search_config = SearchConfig::new()
            .with_field("email", MatchStrategy::Exact)
            .with_field("name", MatchStrategy::StartsWith);
        let d = QueryDescriptor::new().with_search("ada", ["name", "email"]);
        let compiled = RelationalCompiler::new(&ctx).compile(&d);

        assert_eq!(compiled.data.params, vec![Value::from("ada%"), Value::from("ada")]);
        assert!(compiled
            .data
            .to_sql()
            .contains("WHERE (\"users\".\"name\" ILIKE $1 OR \"users\".\"email\" = $2)"));
        assert_eq!(
            compiled.search.unwrap().algorithms_used(),
            vec!["startsWith", "exact"]
        );
    }

    #[test]
    fn test_compile_is_deterministic() {
        let d = QueryDescriptor::new()
            .with_condition("b", 1)
            .with_condition("a", OperatorSet::new().any_of(vec![Value::Int64(1), Value::Int64(2)]))
            .with_sort("a", SortDirection::Asc)
            .with_pagination(1, 20);
        let ctx = ctx();
        let first = RelationalCompiler::new(&ctx).compile(&d);
        let second = RelationalCompiler::new(&ctx).compile(&d);
        assert_eq!(first, second);
        assert_eq!(first.data.to_sql(), second.data.to_sql());
    }
}
