use serde_json::Value as Json;

use super::pipeline::Pipeline;
use crate::query::descriptor::{SortDirection, SortField};
use crate::query::{DescribeError, JoinDescription, PlanDescription};

/// Recover filter, join and sort fields from a pipeline's driver form
pub fn describe(pipeline: &Pipeline) -> Result<PlanDescription, DescribeError> {
    describe_json(&pipeline.to_json())
}

pub fn describe_json(pipeline: &Json) -> Result<PlanDescription, DescribeError> {
    let stages = pipeline
        .as_array()
        .ok_or_else(|| DescribeError::Malformed("pipeline is not an array".into()))?;

    let mut out = PlanDescription::default();
    for stage in stages {
        let (name, body) = stage
            .as_object()
            .filter(|o| o.len() == 1)
            .and_then(|o| o.iter().next())
            .ok_or_else(|| DescribeError::Malformed(format!("bad stage {}", stage)))?;

        match name.as_str() {
            "$match" => collect_match_fields(body, &mut out.filter_fields),
            "$lookup" => out.joins.push(describe_lookup(body)?),
            "$sort" => {
                let fields = body
                    .as_object()
                    .ok_or_else(|| DescribeError::Malformed("$sort is not an object".into()))?;
                for (field, direction) in fields {
                    out.sort.push(SortField {
                        field: field.clone(),
                        direction: if direction.as_i64() == Some(-1) {
                            SortDirection::Desc
                        } else {
                            SortDirection::Asc
                        },
                    });
                }
            }
            "$unwind" | "$group" | "$project" | "$skip" | "$limit" | "$count" | "$facet" => {}
            other => return Err(DescribeError::Unsupported(format!("stage {}", other))),
        }
    }
    Ok(out)
}

fn describe_lookup(body: &Json) -> Result<JoinDescription, DescribeError> {
    let field = |key: &str| {
        body.get(key)
            .and_then(Json::as_str)
            .map(str::to_string)
            .ok_or_else(|| DescribeError::Malformed(format!("$lookup is missing '{}'", key)))
    };
    Ok(JoinDescription {
        source: field("from")?,
        alias: field("as")?,
        local_field: field("localField")?,
        foreign_field: field("foreignField")?,
    })
}

fn collect_match_fields(query: &Json, fields: &mut Vec<String>) {
    let Some(object) = query.as_object() else {
        return;
    };
    for (key, value) in object {
        match key.as_str() {
            "$and" | "$or" => {
                for item in value.as_array().into_iter().flatten() {
                    collect_match_fields(item, fields);
                }
            }
            // Partition predicates are not caller filters
            "$expr" => {}
            field => {
                if !fields.iter().any(|f| f == field) {
                    fields.push(field.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentCompiler;
    use crate::query::descriptor::{JoinSpec, OperatorSet, QueryDescriptor};
    use crate::query::QueryContext;
    use crate::relational::{self, RelationalCompiler};
    use serde_json::json;

    #[test]
    fn test_round_trip_matches_relational() {
        let d = QueryDescriptor::new()
            .with_condition("status", "ACTIVE")
            .with_condition("age", OperatorSet::new().gte(18).lt(65))
            .with_join(JoinSpec::new("companies", "companyId", "id").with_alias("company"))
            .with_sort("name", SortDirection::Asc)
            .with_sort("createdAt", SortDirection::Desc)
            .with_search("ada", ["name"])
            .with_pagination(2, 5);
        let ctx = QueryContext::new("users", "id");

        let document = describe(&DocumentCompiler::new(&ctx).compile(&d)).unwrap();
        let sql = relational::describe(&RelationalCompiler::new(&ctx).compile(&d).data).unwrap();
        assert_eq!(document, sql);
        assert_eq!(document.filter_fields, vec!["age", "status", "name"]);
    }

    #[test]
    fn test_partition_match_is_not_a_filter() {
        let d = QueryDescriptor::new().with_condition("status", "ACTIVE");
        let ctx = QueryContext::new("users", "id");
        let pipeline = DocumentCompiler::new(&ctx).compile_partition(&d, "id", 4, 1);
        let description = describe(&pipeline).unwrap();
        assert_eq!(description.filter_fields, vec!["status"]);
    }

    #[test]
    fn test_rejects_unknown_stage() {
        let json = json!([{ "$out": "elsewhere" }]);
        assert!(matches!(describe_json(&json), Err(DescribeError::Unsupported(_))));
        assert!(describe_json(&json!({ "$match": {} })).is_err());
    }
}
