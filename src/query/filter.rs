//! Normalized filters shared by both compilers.
//!
//! Conditions arrive as a field -> condition map; the compilers consume a flat,
//! ordered list of single-operator filters so the relational and document
//! plans apply exactly the same predicates.

use serde::{Deserialize, Serialize};

use super::descriptor::{Condition, Conditions};
use crate::data::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
    Like,
    IsNull,
    IsNotNull,
}

impl FilterOperator {
    /// SQL spelling for binary comparison operators
    pub fn sql(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::NotEq => "<>",
            FilterOperator::Lt => "<",
            FilterOperator::LtEq => "<=",
            FilterOperator::Gt => ">",
            FilterOperator::GtEq => ">=",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT IN",
            FilterOperator::Like => "LIKE",
            FilterOperator::IsNull => "IS NULL",
            FilterOperator::IsNotNull => "IS NOT NULL",
        }
    }

    /// Document-store operator name
    pub fn mongo(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "$eq",
            FilterOperator::NotEq => "$ne",
            FilterOperator::Lt => "$lt",
            FilterOperator::LtEq => "$lte",
            FilterOperator::Gt => "$gt",
            FilterOperator::GtEq => "$gte",
            FilterOperator::In => "$in",
            FilterOperator::NotIn => "$nin",
            FilterOperator::Like => "$regex",
            FilterOperator::IsNull | FilterOperator::IsNotNull => "$exists",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub operator: FilterOperator,
    /// Operand; an array for IN / NOT IN, `Null` for the null checks
    pub value: Value,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// First path segment of the filtered field
    pub fn root(&self) -> &str {
        self.field.split('.').next().unwrap_or_default()
    }
}

/// Expand one condition into single-operator filters, in a fixed operator order
pub fn expand_condition(field: &str, condition: &Condition) -> Vec<FieldFilter> {
    match condition {
        Condition::Equals(Value::Array(values)) => {
            vec![FieldFilter::new(field, FilterOperator::In, Value::Array(values.clone()))]
        }
        Condition::Equals(Value::Null) => {
            vec![FieldFilter::new(field, FilterOperator::IsNull, Value::Null)]
        }
        Condition::Equals(value) => vec![FieldFilter::new(field, FilterOperator::Eq, value.clone())],
        Condition::Operators(ops) => {
            let mut filters = Vec::new();
            let mut push = |op: FilterOperator, value: &Option<Value>| {
                if let Some(v) = value {
                    filters.push(FieldFilter::new(field, op, v.clone()));
                }
            };
            push(FilterOperator::Eq, &ops.eq);
            push(FilterOperator::NotEq, &ops.ne);
            push(FilterOperator::Gt, &ops.gt);
            push(FilterOperator::GtEq, &ops.gte);
            push(FilterOperator::Lt, &ops.lt);
            push(FilterOperator::LtEq, &ops.lte);
            if let Some(values) = &ops.any_of {
                filters.push(FieldFilter::new(field, FilterOperator::In, Value::Array(values.clone())));
            }
            if let Some(values) = &ops.none_of {
                filters.push(FieldFilter::new(
                    field,
                    FilterOperator::NotIn,
                    Value::Array(values.clone()),
                ));
            }
            if let Some(pattern) = &ops.like {
                filters.push(FieldFilter::new(field, FilterOperator::Like, Value::from(pattern.as_str())));
            }
            match ops.exists {
                Some(true) => filters.push(FieldFilter::new(field, FilterOperator::IsNotNull, Value::Null)),
                Some(false) => filters.push(FieldFilter::new(field, FilterOperator::IsNull, Value::Null)),
                None => {}
            }
            filters
        }
    }
}

pub fn conditions_to_filters(conditions: &Conditions) -> Vec<FieldFilter> {
    conditions
        .iter()
        .flat_map(|(field, condition)| expand_condition(field, condition))
        .collect()
}

/// Merge server-imposed conditions with caller conditions.
///
/// Backend conditions come first. A caller condition on a field the backend
/// already constrains is dropped.
pub fn merge_conditions(backend: &Conditions, caller: &Conditions) -> Vec<FieldFilter> {
    let mut filters = conditions_to_filters(backend);
    for (field, condition) in caller {
        if backend.contains_key(field) {
            tracing::debug!("Ignoring caller condition on '{}': fixed by backend", field);
            continue;
        }
        filters.extend(expand_condition(field, condition));
    }
    filters
}
