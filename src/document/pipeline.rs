//! Document-store aggregation pipelines.
//!
//! Stages are evaluated in order. [`Pipeline::to_json`] renders the
//! MongoDB-style form a document driver would receive.

use serde::Serialize;
use serde_json::{json, Map, Value as Json};

use crate::data::Value;
use crate::query::descriptor::AggregateOp;
use crate::query::filter::FilterOperator;
use crate::schema::PopulateNode;

/// Filter expression evaluated by `$match` and conditional accumulators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MatchExpr {
    Field {
        path: String,
        op: FilterOperator,
        value: Value,
    },
    Regex {
        path: String,
        pattern: String,
        case_insensitive: bool,
    },
    And(Vec<MatchExpr>),
    Or(Vec<MatchExpr>),
    /// Rows whose `path` hashes into bucket `index` of `partitions`
    Partition {
        path: String,
        partitions: usize,
        index: usize,
    },
}

impl MatchExpr {
    /// Dotted paths referenced, in order of appearance
    pub fn paths(&self) -> Vec<&str> {
        match self {
            MatchExpr::Field { path, .. }
            | MatchExpr::Regex { path, .. }
            | MatchExpr::Partition { path, .. } => vec![path.as_str()],
            MatchExpr::And(items) | MatchExpr::Or(items) => {
                items.iter().flat_map(|m| m.paths()).collect()
            }
        }
    }

    /// Query-document form used inside `$match`
    pub fn to_query_json(&self) -> Json {
        match self {
            MatchExpr::Field { path, op, value } => {
                let operand = match op {
                    FilterOperator::Eq => value.to_json(),
                    FilterOperator::IsNull => Json::Null,
                    FilterOperator::IsNotNull => json!({ "$ne": null }),
                    other => json!({ other.mongo(): value.to_json() }),
                };
                json!({ path.as_str(): operand })
            }
            MatchExpr::Regex {
                path,
                pattern,
                case_insensitive,
            } => {
                let mut regex = Map::new();
                regex.insert("$regex".into(), Json::String(pattern.clone()));
                if *case_insensitive {
                    regex.insert("$options".into(), Json::String("i".into()));
                }
                json!({ path.as_str(): Json::Object(regex) })
            }
            MatchExpr::And(items) => {
                json!({ "$and": items.iter().map(MatchExpr::to_query_json).collect::<Vec<_>>() })
            }
            MatchExpr::Or(items) => {
                json!({ "$or": items.iter().map(MatchExpr::to_query_json).collect::<Vec<_>>() })
            }
            MatchExpr::Partition { .. } => json!({ "$expr": self.to_expr_json() }),
        }
    }

    /// Aggregation-expression form used by `$cond`
    pub fn to_expr_json(&self) -> Json {
        match self {
            MatchExpr::Field { path, op, value } => {
                let field = format!("${}", path);
                match op {
                    FilterOperator::IsNull => json!({ "$eq": [field, null] }),
                    FilterOperator::IsNotNull => json!({ "$ne": [field, null] }),
                    FilterOperator::NotIn => {
                        json!({ "$not": [{ "$in": [field, value.to_json()] }] })
                    }
                    other => json!({ other.mongo(): [field, value.to_json()] }),
                }
            }
            MatchExpr::Regex {
                path,
                pattern,
                case_insensitive,
            } => {
                let options = if *case_insensitive { "i" } else { "" };
                json!({
                    "$regexMatch": {
                        "input": format!("${}", path),
                        "regex": pattern,
                        "options": options,
                    }
                })
            }
            MatchExpr::And(items) => {
                json!({ "$and": items.iter().map(MatchExpr::to_expr_json).collect::<Vec<_>>() })
            }
            MatchExpr::Or(items) => {
                json!({ "$or": items.iter().map(MatchExpr::to_expr_json).collect::<Vec<_>>() })
            }
            MatchExpr::Partition {
                path,
                partitions,
                index,
            } => json!({
                "$eq": [
                    { "$mod": [{ "$abs": { "$toHashedIndexKey": format!("${}", path) } }, partitions] },
                    index
                ]
            }),
        }
    }
}

/// `$group` key: all rows, one field, or several
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum GroupKey {
    All,
    Single(String),
    Composite(Vec<String>),
}

impl GroupKey {
    pub fn fields(&self) -> Vec<&str> {
        match self {
            GroupKey::All => Vec::new(),
            GroupKey::Single(field) => vec![field.as_str()],
            GroupKey::Composite(fields) => fields.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupAccumulator {
    pub output: String,
    pub op: AggregateOp,
    /// `None` counts every row
    pub field: Option<String>,
    /// Only rows matching contribute
    pub condition: Option<MatchExpr>,
}

impl GroupAccumulator {
    fn to_json(&self) -> Json {
        let operand = match &self.field {
            Some(f) => Json::String(format!("${}", f)),
            None => Json::Null,
        };
        let conditional = |then: Json, otherwise: Json| match &self.condition {
            Some(c) => json!({ "$cond": [c.to_expr_json(), then, otherwise] }),
            None => then,
        };
        match self.op {
            // A conditional count counts matching rows, like COUNT(CASE WHEN .. THEN 1 END)
            AggregateOp::Count => {
                let counted = match (&self.field, &self.condition) {
                    (Some(f), None) => json!({ "$cond": [{ "$ne": [format!("${}", f), null] }, 1, 0] }),
                    _ => json!(1),
                };
                json!({ "$sum": conditional(counted, json!(0)) })
            }
            AggregateOp::Sum => json!({ "$sum": conditional(operand, json!(0)) }),
            AggregateOp::Avg => json!({ "$avg": conditional(operand, Json::Null) }),
            AggregateOp::Min => json!({ "$min": conditional(operand, Json::Null) }),
            AggregateOp::Max => json!({ "$max": conditional(operand, Json::Null) }),
            AggregateOp::Concat => json!({ "$push": conditional(operand, Json::Null) }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Stage {
    Match(MatchExpr),
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    Unwind {
        path: String,
        preserve_null_and_empty: bool,
    },
    /// Groups rows; key fields are lifted into each output document
    Group {
        key: GroupKey,
        accumulators: Vec<GroupAccumulator>,
    },
    Project(Vec<String>),
    Sort(Vec<(String, i8)>),
    Skip(u64),
    Limit(u64),
    Count(String),
    /// Page and total computed from the same input in one pass
    Facet {
        data: Vec<Stage>,
        total: Vec<Stage>,
    },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Lookup { .. } => "$lookup",
            Stage::Unwind { .. } => "$unwind",
            Stage::Group { .. } => "$group",
            Stage::Project(_) => "$project",
            Stage::Sort(_) => "$sort",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::Count(_) => "$count",
            Stage::Facet { .. } => "$facet",
        }
    }

    /// Driver form; a group renders as `$group` plus the `$project` that lifts its key
    fn render(&self, out: &mut Vec<Json>) {
        match self {
            Stage::Match(expr) => out.push(json!({ "$match": expr.to_query_json() })),
            Stage::Lookup {
                from,
                local_field,
                foreign_field,
                as_field,
            } => out.push(json!({
                "$lookup": {
                    "from": from,
                    "localField": local_field,
                    "foreignField": foreign_field,
                    "as": as_field,
                }
            })),
            Stage::Unwind {
                path,
                preserve_null_and_empty,
            } => out.push(json!({
                "$unwind": {
                    "path": format!("${}", path),
                    "preserveNullAndEmptyArrays": preserve_null_and_empty,
                }
            })),
            Stage::Group { key, accumulators } => {
                let id = match key {
                    GroupKey::All => Json::Null,
                    GroupKey::Single(field) => Json::String(format!("${}", field)),
                    GroupKey::Composite(fields) => Json::Object(
                        fields
                            .iter()
                            .map(|f| (id_key(f), Json::String(format!("${}", f))))
                            .collect(),
                    ),
                };
                let mut group = Map::new();
                group.insert("_id".into(), id);
                let mut lift = Map::new();
                lift.insert("_id".into(), json!(0));
                match key {
                    GroupKey::All => {}
                    GroupKey::Single(field) => {
                        lift.insert(field.clone(), json!("$_id"));
                    }
                    GroupKey::Composite(fields) => {
                        for f in fields {
                            lift.insert(f.clone(), Json::String(format!("$_id.{}", id_key(f))));
                        }
                    }
                }
                for acc in accumulators {
                    group.insert(acc.output.clone(), acc.to_json());
                    lift.insert(acc.output.clone(), json!(1));
                }
                out.push(json!({ "$group": Json::Object(group) }));
                out.push(json!({ "$project": Json::Object(lift) }));
            }
            Stage::Project(fields) => {
                let projection: Map<String, Json> =
                    fields.iter().map(|f| (f.clone(), json!(1))).collect();
                out.push(json!({ "$project": Json::Object(projection) }));
            }
            Stage::Sort(fields) => {
                let sort: Map<String, Json> =
                    fields.iter().map(|(f, d)| (f.clone(), json!(d))).collect();
                out.push(json!({ "$sort": Json::Object(sort) }));
            }
            Stage::Skip(n) => out.push(json!({ "$skip": n })),
            Stage::Limit(n) => out.push(json!({ "$limit": n })),
            Stage::Count(field) => out.push(json!({ "$count": field })),
            Stage::Facet { data, total } => out.push(json!({
                "$facet": {
                    "data": render_stages(data),
                    "total": render_stages(total),
                }
            })),
        }
    }
}

/// `_id` sub-document keys cannot contain dots
fn id_key(field: &str) -> String {
    field.replace('.', "_")
}

fn render_stages(stages: &[Stage]) -> Vec<Json> {
    let mut out = Vec::with_capacity(stages.len());
    for stage in stages {
        stage.render(&mut out);
    }
    out
}

/// Execution hints attached by the strategy planner
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineOptions {
    pub allow_disk_use: bool,
    pub parallel_lookups: bool,
    /// Cursor batch size; `None` returns everything at once
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
    /// Relations loaded onto output documents after the pipeline runs
    pub populate: Vec<PopulateNode>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            populate: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Json {
        Json::Array(render_stages(&self.stages))
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// The `$facet` stage of a paginated pipeline
    pub fn facet(&self) -> Option<(&[Stage], &[Stage])> {
        self.stages.iter().find_map(|s| match s {
            Stage::Facet { data, total } => Some((data.as_slice(), total.as_slice())),
            _ => None,
        })
    }

    pub fn is_paginated(&self) -> bool {
        self.facet().is_some()
    }

    /// `(path, descending)` keys of the last top-level `$sort`
    pub fn sort_keys(&self) -> Vec<(String, bool)> {
        self.stages
            .iter()
            .rev()
            .find_map(|s| match s {
                Stage::Sort(keys) => Some(
                    keys.iter()
                        .map(|(field, direction)| (field.clone(), *direction < 0))
                        .collect(),
                ),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn lookup_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| matches!(s, Stage::Lookup { .. }))
            .count()
    }
}
