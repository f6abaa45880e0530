use std::collections::HashSet;

use super::pipeline::{GroupAccumulator, GroupKey, MatchExpr, Pipeline, Stage};
use crate::data::Value;
use crate::query::descriptor::{AggregateOp, JoinType, QueryDescriptor};
use crate::query::filter::{conditions_to_filters, merge_conditions, FieldFilter, FilterOperator};
use crate::query::search::{like_to_regex, plan_search, regex_pattern, MatchStrategy, SearchPlan};
use crate::query::QueryContext;

/// Field the `$count` stages write the total under
pub const TOTAL_FIELD: &str = "total";

/// Compiles descriptors into aggregation pipelines
pub struct DocumentCompiler<'a> {
    ctx: &'a QueryContext,
}

/// A valid join and the name its record is exposed under
struct LookupJoin<'d> {
    source: &'d str,
    local_field: &'d str,
    foreign_field: &'d str,
    alias: String,
    join_type: JoinType,
}

impl<'a> DocumentCompiler<'a> {
    pub fn new(ctx: &'a QueryContext) -> Self {
        Self { ctx }
    }

    /// Full pipeline; a paginated descriptor ends in a `$facet` producing page and total
    pub fn compile(&self, descriptor: &QueryDescriptor) -> Pipeline {
        let mut stages = self.compile_filter_stages(descriptor);
        stages.extend(self.compile_shape_stages(descriptor));
        if let Some(pagination) = &descriptor.pagination {
            stages.push(Stage::Facet {
                data: vec![Stage::Skip(pagination.skip()), Stage::Limit(pagination.limit)],
                total: vec![Stage::Count(TOTAL_FIELD.to_string())],
            });
        }
        tracing::debug!(
            "Compiled pipeline for '{}': {} stages",
            self.ctx.entity,
            stages.len()
        );
        self.finish(stages)
    }

    /// Every output row in order, without pagination
    pub fn compile_unpaged(&self, descriptor: &QueryDescriptor) -> Pipeline {
        let mut stages = self.compile_filter_stages(descriptor);
        stages.extend(self.compile_shape_stages(descriptor));
        self.finish(stages)
    }

    /// Number of output rows (groups when grouping)
    pub fn compile_count(&self, descriptor: &QueryDescriptor) -> Pipeline {
        let mut stages = self.compile_filter_stages(descriptor);
        if let Some(group) = self.compile_group(descriptor) {
            stages.push(group);
        }
        stages.push(Stage::Count(TOTAL_FIELD.to_string()));
        Pipeline::new(stages)
    }

    /// Number of rows entering aggregation; used for size estimation
    pub fn compile_estimate(&self, descriptor: &QueryDescriptor) -> Pipeline {
        let mut stages = self.compile_filter_stages(descriptor);
        stages.push(Stage::Count(TOTAL_FIELD.to_string()));
        Pipeline::new(stages)
    }

    /// One hash partition of the unpaged pipeline
    pub fn compile_partition(
        &self,
        descriptor: &QueryDescriptor,
        key: &str,
        partitions: usize,
        index: usize,
    ) -> Pipeline {
        let mut stages = self.compile_filter_stages(descriptor);
        stages.push(Stage::Match(MatchExpr::Partition {
            path: key.to_string(),
            partitions,
            index,
        }));
        stages.extend(self.compile_shape_stages(descriptor));
        self.finish(stages)
    }

    /// Search plan the filter stages apply, if any
    pub fn search_plan(&self, descriptor: &QueryDescriptor) -> Option<SearchPlan> {
        plan_search(descriptor.search.as_ref(), &self.ctx.search_config)
    }

    fn finish(&self, stages: Vec<Stage>) -> Pipeline {
        Pipeline {
            stages,
            populate: self.ctx.populate.clone(),
        }
    }

    fn valid_joins<'d>(&self, descriptor: &'d QueryDescriptor) -> Vec<LookupJoin<'d>> {
        let entity = self.ctx.entity.as_str();
        let mut joins: Vec<LookupJoin<'d>> = Vec::new();
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
            if matches!(spec.join_type, JoinType::Right | JoinType::Full) {
                tracing::warn!(
                    "Join '{}' on '{}': {:?} join runs as a left outer lookup",
                    alias,
                    entity,
                    spec.join_type
                );
            }
            joins.push(LookupJoin {
                source: &spec.source,
                local_field: &spec.local_field,
                foreign_field: &spec.foreign_field,
                alias,
                join_type: spec.join_type,
            });
        }
        joins
    }

    /// `$match` / `$lookup` / `$unwind` prefix shared by every pipeline variant
    fn compile_filter_stages(&self, descriptor: &QueryDescriptor) -> Vec<Stage> {
        let joins = self.valid_joins(descriptor);
        let aliases: HashSet<&str> = joins.iter().map(|j| j.alias.as_str()).collect();
        let on_alias = |field: &str| {
            field
                .split_once('.')
                .map(|(root, _)| aliases.contains(root))
                .unwrap_or(false)
        };

        let filters = merge_conditions(&self.ctx.backend_conditions, &descriptor.conditions);
        let (post_lookup, pre_lookup): (Vec<FieldFilter>, Vec<FieldFilter>) =
            filters.into_iter().partition(|f| on_alias(&f.field));

        let mut before: Vec<MatchExpr> = pre_lookup.iter().map(filter_expr).collect();
        let mut after: Vec<MatchExpr> = post_lookup.iter().map(filter_expr).collect();

        if let Some(plan) = self.search_plan(descriptor) {
            let expr = search_expr(&plan);
            if plan.matches.iter().any(|m| on_alias(&m.field)) {
                after.push(expr);
            } else {
                before.push(expr);
            }
        }

        let mut stages = Vec::new();
        if let Some(expr) = combine(before) {
            stages.push(Stage::Match(expr));
        }
        for join in &joins {
            stages.push(Stage::Lookup {
                from: join.source.to_string(),
                local_field: join.local_field.to_string(),
                foreign_field: join.foreign_field.to_string(),
                as_field: join.alias.clone(),
            });
            stages.push(Stage::Unwind {
                path: join.alias.clone(),
                preserve_null_and_empty: join.join_type != JoinType::Inner,
            });
        }
        if let Some(expr) = combine(after) {
            stages.push(Stage::Match(expr));
        }
        stages
    }

    fn compile_group(&self, descriptor: &QueryDescriptor) -> Option<Stage> {
        if !descriptor.has_grouping() {
            return None;
        }
        let key = match descriptor.group_by.as_slice() {
            [] => GroupKey::All,
            [field] => GroupKey::Single(field.clone()),
            fields => GroupKey::Composite(fields.to_vec()),
        };

        let mut accumulators = Vec::new();
        for spec in &descriptor.aggregations {
            let output = spec.output_name();
            let field = spec.column().map(str::to_string);
            if field.is_none() && spec.operation != AggregateOp::Count {
                tracing::warn!(
                    "Skipping aggregation '{}': {} requires a field",
                    output,
                    spec.operation.name()
                );
                continue;
            }
            let condition = spec.conditions.as_ref().and_then(|conditions| {
                combine(conditions_to_filters(conditions).iter().map(filter_expr).collect())
            });
            accumulators.push(GroupAccumulator {
                output,
                op: spec.operation,
                field,
                condition,
            });
        }
        Some(Stage::Group { key, accumulators })
    }

    /// Group, projection and sort.
    ///
    /// `$project` normally precedes `$sort`. When the projection drops a
    /// sort key the order flips to `$sort` then `$project`, since sorting
    /// after the projection would compare missing fields; the page contents
    /// match the relational plan either way.
    fn compile_shape_stages(&self, descriptor: &QueryDescriptor) -> Vec<Stage> {
        let mut stages = Vec::new();
        if let Some(group) = self.compile_group(descriptor) {
            stages.push(group);
        }

        let sort = self.compile_sort(descriptor);
        let project = if descriptor.select.is_empty() {
            None
        } else {
            Some(Stage::Project(descriptor.select.clone()))
        };

        // A projection that drops a sort key would leave nothing to sort on
        let drops_sort_key = sort.iter().any(|(field, _)| {
            !descriptor.select.is_empty() && !descriptor.select.iter().any(|s| s == field)
        });
        match (project, sort.is_empty()) {
            (Some(project), false) if drops_sort_key => {
                stages.push(Stage::Sort(sort));
                stages.push(project);
            }
            (project, empty) => {
                stages.extend(project);
                if !empty {
                    stages.push(Stage::Sort(sort));
                }
            }
        }
        stages
    }

    fn compile_sort(&self, descriptor: &QueryDescriptor) -> Vec<(String, i8)> {
        if !descriptor.sort.is_empty() {
            return descriptor
                .sort
                .fields()
                .iter()
                .map(|s| (s.field.clone(), s.direction.numeric()))
                .collect();
        }
        if descriptor.has_grouping() {
            return descriptor.group_by.iter().map(|f| (f.clone(), 1)).collect();
        }
        vec![(self.ctx.primary_key.clone(), -1)]
    }
}

fn combine(mut exprs: Vec<MatchExpr>) -> Option<MatchExpr> {
    match exprs.len() {
        0 => None,
        1 => exprs.pop(),
        _ => Some(MatchExpr::And(exprs)),
    }
}

fn filter_expr(filter: &FieldFilter) -> MatchExpr {
    match filter.operator {
        FilterOperator::Like => MatchExpr::Regex {
            path: filter.field.clone(),
            pattern: like_to_regex(filter.value.as_str().unwrap_or_default()),
            case_insensitive: false,
        },
        FilterOperator::In | FilterOperator::NotIn => MatchExpr::Field {
            path: filter.field.clone(),
            op: filter.operator,
            value: match &filter.value {
                Value::Array(_) => filter.value.clone(),
                other => Value::Array(vec![other.clone()]),
            },
        },
        op => MatchExpr::Field {
            path: filter.field.clone(),
            op,
            value: filter.value.clone(),
        },
    }
}

fn search_expr(plan: &SearchPlan) -> MatchExpr {
    MatchExpr::Or(
        plan.matches
            .iter()
            .map(|m| match m.strategy {
                MatchStrategy::Exact => MatchExpr::Field {
                    path: m.field.clone(),
                    op: FilterOperator::Eq,
                    value: Value::from(plan.term.as_str()),
                },
                strategy => MatchExpr::Regex {
                    path: m.field.clone(),
                    pattern: regex_pattern(&plan.term, strategy),
                    case_insensitive: true,
                },
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::descriptor::{AggregationSpec, JoinSpec, OperatorSet, SortDirection};
    use serde_json::json;

    fn ctx() -> QueryContext {
        QueryContext::new("users", "id")
    }

    #[test]
    fn test_stage_order() {
        let d = QueryDescriptor::new()
            .with_condition("status", "ACTIVE")
            .with_join(JoinSpec::new("companies", "companyId", "id").with_alias("company"))
            .with_aggregation(AggregationSpec::count_all().with_alias("n"))
            .with_group_by("company.name")
            .with_select(["company.name", "n"])
            .with_pagination(1, 10);
        let ctx = ctx();
        let pipeline = DocumentCompiler::new(&ctx).compile(&d);
        assert_eq!(
            pipeline.stage_names(),
            vec!["$match", "$lookup", "$unwind", "$group", "$project", "$sort", "$facet"]
        );
    }

    #[test]
    fn test_default_sort_and_facet() {
        let d = QueryDescriptor::new()
            .with_condition("status", "ACTIVE")
            .with_pagination(2, 5);
        let ctx = ctx();
        let json = DocumentCompiler::new(&ctx).compile(&d).to_json();
        assert_eq!(json[0], json!({ "$match": { "status": "ACTIVE" } }));
        assert_eq!(json[1], json!({ "$sort": { "id": -1 } }));
        assert_eq!(
            json[2],
            json!({ "$facet": {
                "data": [{ "$skip": 5 }, { "$limit": 5 }],
                "total": [{ "$count": "total" }]
            } })
        );
    }

    #[test]
    fn test_lookup_unwind_preserves_unmatched() {
        let d = QueryDescriptor::new()
            .with_join(JoinSpec::new("companies", "companyId", "id").with_alias("company"))
            .with_join(JoinSpec::new("teams", "teamId", "id").with_type(JoinType::Inner));
        let ctx = ctx();
        let pipeline = DocumentCompiler::new(&ctx).compile(&d);
        assert_eq!(pipeline.lookup_count(), 2);
        assert_eq!(
            pipeline.stages[1],
            Stage::Unwind {
                path: "company".into(),
                preserve_null_and_empty: true
            }
        );
        assert_eq!(
            pipeline.stages[3],
            Stage::Unwind {
                path: "teams".into(),
                preserve_null_and_empty: false
            }
        );
    }

    #[test]
    fn test_alias_conditions_match_after_lookup() {
        let d = QueryDescriptor::new()
            .with_condition("status", "ACTIVE")
            .with_condition("company.country", "NZ")
            .with_join(JoinSpec::new("companies", "companyId", "id").with_alias("company"));
        let ctx = ctx();
        let pipeline = DocumentCompiler::new(&ctx).compile(&d);
        assert_eq!(pipeline.stage_names(), vec!["$match", "$lookup", "$unwind", "$match", "$sort"]);
        match &pipeline.stages[3] {
            Stage::Match(expr) => assert_eq!(expr.paths(), vec!["company.country"]),
            other => panic!("unexpected stage {:?}", other),
        }
    }

    #[test]
    fn test_group_keys() {
        let ctx = ctx();
        let compiler = DocumentCompiler::new(&ctx);

        let all = QueryDescriptor::new().with_aggregation(AggregationSpec::new(AggregateOp::Sum, "amount"));
        match compiler.compile_group(&all) {
            Some(Stage::Group { key, accumulators }) => {
                assert_eq!(key, GroupKey::All);
                assert_eq!(accumulators[0].output, "sum_amount");
            }
            other => panic!("unexpected {:?}", other),
        }

        let composite = QueryDescriptor::new().with_group_by("region").with_group_by("tier");
        assert!(matches!(
            compiler.compile_group(&composite),
            Some(Stage::Group { key: GroupKey::Composite(_), .. })
        ));

        // A grouped pipeline without explicit sort orders by its key
        assert_eq!(compiler.compile_sort(&composite), vec![("region".to_string(), 1), ("tier".to_string(), 1)]);
        assert!(compiler.compile_sort(&all).is_empty());
    }

    #[test]
    fn test_projection_keeps_sort_key_available() {
        let d = QueryDescriptor::new().with_select(["name"]);
        let ctx = ctx();
        let pipeline = DocumentCompiler::new(&ctx).compile(&d);
        assert_eq!(pipeline.stage_names(), vec!["$sort", "$project"]);

        let d = QueryDescriptor::new()
            .with_select(["name"])
            .with_sort("name", SortDirection::Asc);
        let pipeline = DocumentCompiler::new(&ctx).compile(&d);
        assert_eq!(pipeline.stage_names(), vec!["$project", "$sort"]);
    }

    #[test]
    fn test_count_and_estimate_share_prefix() {
        let d = QueryDescriptor::new()
            .with_condition("age", OperatorSet::new().gte(18))
            .with_join(JoinSpec::new("companies", "companyId", "id"))
            .with_group_by("region")
            .with_pagination(1, 10);
        let ctx = ctx();
        let compiler = DocumentCompiler::new(&ctx);

        let data = compiler.compile(&d);
        let count = compiler.compile_count(&d);
        let estimate = compiler.compile_estimate(&d);
        assert_eq!(data.stages[..3], count.stages[..3]);
        assert_eq!(data.stages[..3], estimate.stages[..3]);
        assert_eq!(count.stage_names(), vec!["$match", "$lookup", "$unwind", "$group", "$count"]);
        assert_eq!(estimate.stage_names(), vec!["$match", "$lookup", "$unwind", "$count"]);
    }

    #[test]
    fn test_search_regex() {
        let mut ctx = ctx();
        ctx.search_config = crate::query::search::SearchConfig::new()
            .with_field("name", MatchStrategy::StartsWith)
            .with_field("email", MatchStrategy::Exact);
        let d = QueryDescriptor::new().with_search("ada", Vec::<String>::new());
        let json = DocumentCompiler::new(&ctx).compile(&d).to_json();
        assert_eq!(
            json[0],
            json!({ "$match": { "$or": [
                { "email": "ada" },
                { "name": { "$regex": "^ada", "$options": "i" } }
            ] } })
        );
    }

    #[test]
    fn test_compile_is_deterministic() {
        let d = QueryDescriptor::new()
            .with_condition("b", 2)
            .with_condition("a", OperatorSet::new().like("x%"))
            .with_search("q", ["a", "b"])
            .with_pagination(3, 7);
        let ctx = ctx();
        let compiler = DocumentCompiler::new(&ctx);
        assert_eq!(compiler.compile(&d), compiler.compile(&d));
        assert_eq!(compiler.compile(&d).to_json(), compiler.compile(&d).to_json());
    }
}
