//! Backend-agnostic query description.
//!
//! A [`QueryDescriptor`] is plain data. Both compilers read it and neither
//! mutates it, so the same descriptor always yields the same plans.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::data::Value;

/// Field -> condition map; ordered so compiled plans are deterministic
pub type Conditions = BTreeMap<String, Condition>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryDescriptor {
    pub conditions: Conditions,
    pub joins: Vec<JoinSpec>,
    pub aggregations: Vec<AggregationSpec>,
    pub group_by: Vec<String>,
    pub sort: SortSpec,
    pub select: Vec<String>,
    pub pagination: Option<Pagination>,
    pub search: Option<SearchSpec>,
    /// Deep relation paths to populate on returned items
    pub relations: Vec<String>,
}

impl QueryDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition(mut self, field: impl Into<String>, condition: impl Into<Condition>) -> Self {
        self.conditions.insert(field.into(), condition.into());
        self
    }

    pub fn with_join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }

    pub fn with_aggregation(mut self, aggregation: AggregationSpec) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn with_group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(field, direction);
        self
    }

    pub fn with_select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn with_pagination(mut self, page: u64, limit: u64) -> Self {
        self.pagination = Some(Pagination { page, limit });
        self
    }

    pub fn with_search<I, S>(mut self, term: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search = Some(SearchSpec {
            term: term.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_relations<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relations.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn has_grouping(&self) -> bool {
        !self.aggregations.is_empty() || !self.group_by.is_empty()
    }

    /// Reject descriptors whose pagination violates `page >= 1, limit >= 1`
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if let Some(pagination) = &self.pagination {
            if pagination.page == 0 {
                return Err(DescriptorError::InvalidPage(pagination.page));
            }
            if pagination.limit == 0 {
                return Err(DescriptorError::InvalidLimit(pagination.limit));
            }
        }
        if let Some(search) = &self.search {
            if search.fields.iter().any(|f| f.trim().is_empty()) {
                return Err(DescriptorError::InvalidSearchField);
            }
        }
        Ok(())
    }

    /// Parse a descriptor from JSON text
    pub fn from_json_str(json: &str) -> Result<Self, DescriptorError> {
        let descriptor: QueryDescriptor = serde_json::from_str(json)?;
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// A field condition: a bare value means equality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Operators(OperatorSet),
    Equals(Value),
}

impl From<Value> for Condition {
    fn from(value: Value) -> Self {
        Condition::Equals(value)
    }
}

impl From<&str> for Condition {
    fn from(value: &str) -> Self {
        Condition::Equals(Value::from(value))
    }
}

impl From<String> for Condition {
    fn from(value: String) -> Self {
        Condition::Equals(Value::String(value))
    }
}

impl From<i64> for Condition {
    fn from(value: i64) -> Self {
        Condition::Equals(Value::Int64(value))
    }
}

impl From<i32> for Condition {
    fn from(value: i32) -> Self {
        Condition::Equals(Value::Int64(value as i64))
    }
}

impl From<bool> for Condition {
    fn from(value: bool) -> Self {
        Condition::Equals(Value::Bool(value))
    }
}

impl From<OperatorSet> for Condition {
    fn from(ops: OperatorSet) -> Self {
        Condition::Operators(ops)
    }
}

/// Range / operator form of a condition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ne: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<Value>,
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<Value>>,
    #[serde(default, rename = "nin", skip_serializing_if = "Option::is_none")]
    pub none_of: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
}

impl OperatorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gt(mut self, value: impl Into<Value>) -> Self {
        self.gt = Some(value.into());
        self
    }

    pub fn gte(mut self, value: impl Into<Value>) -> Self {
        self.gte = Some(value.into());
        self
    }

    pub fn lt(mut self, value: impl Into<Value>) -> Self {
        self.lt = Some(value.into());
        self
    }

    pub fn lte(mut self, value: impl Into<Value>) -> Self {
        self.lte = Some(value.into());
        self
    }

    pub fn ne(mut self, value: impl Into<Value>) -> Self {
        self.ne = Some(value.into());
        self
    }

    pub fn any_of<I: IntoIterator<Item = Value>>(mut self, values: I) -> Self {
        self.any_of = Some(values.into_iter().collect());
        self
    }

    pub fn none_of<I: IntoIterator<Item = Value>>(mut self, values: I) -> Self {
        self.none_of = Some(values.into_iter().collect());
        self
    }

    pub fn like(mut self, pattern: impl Into<String>) -> Self {
        self.like = Some(pattern.into());
        self
    }

    pub fn exists(mut self, exists: bool) -> Self {
        self.exists = Some(exists);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    #[default]
    #[serde(rename = "LEFT", alias = "left")]
    Left,
    #[serde(rename = "INNER", alias = "inner")]
    Inner,
    #[serde(rename = "RIGHT", alias = "right")]
    Right,
    #[serde(rename = "FULL", alias = "full")]
    Full,
}

impl JoinType {
    pub fn keyword(&self) -> &'static str {
        match self {
            JoinType::Left => "LEFT JOIN",
            JoinType::Inner => "INNER JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Full => "FULL JOIN",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinSpec {
    pub source: String,
    pub local_field: String,
    pub foreign_field: String,
    /// Name the joined record is exposed under; defaults to `source`
    pub alias: Option<String>,
    pub join_type: JoinType,
}

impl JoinSpec {
    pub fn new(
        source: impl Into<String>,
        local_field: impl Into<String>,
        foreign_field: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
            alias: None,
            join_type: JoinType::Left,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_type(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }

    pub fn alias_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.source)
    }

    /// Reason the join cannot be compiled, if any
    pub fn defect(&self) -> Option<&'static str> {
        if self.source.trim().is_empty() {
            Some("join is missing its source")
        } else if self.local_field.trim().is_empty() {
            Some("join is missing its local field")
        } else if self.foreign_field.trim().is_empty() {
            Some("join is missing its foreign field")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Concat,
}

impl AggregateOp {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateOp::Count => "count",
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Concat => "concat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationSpec {
    pub operation: AggregateOp,
    /// `None` (or `*`) only makes sense for COUNT
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    /// Only rows matching these conditions feed the aggregate
    #[serde(default)]
    pub conditions: Option<Conditions>,
}

impl AggregationSpec {
    pub fn new(operation: AggregateOp, field: impl Into<String>) -> Self {
        Self {
            operation,
            field: Some(field.into()),
            alias: None,
            conditions: None,
        }
    }

    pub fn count_all() -> Self {
        Self {
            operation: AggregateOp::Count,
            field: None,
            alias: None,
            conditions: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_condition(mut self, field: impl Into<String>, condition: impl Into<Condition>) -> Self {
        self.conditions
            .get_or_insert_with(Conditions::new)
            .insert(field.into(), condition.into());
        self
    }

    /// Column the aggregate reads; `None` means "every row"
    pub fn column(&self) -> Option<&str> {
        self.field.as_deref().filter(|f| *f != "*" && !f.is_empty())
    }

    pub fn output_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| {
            format!("{}_{}", self.operation.name(), self.column().unwrap_or("all"))
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "ASC", alias = "asc")]
    Asc,
    #[default]
    #[serde(rename = "DESC", alias = "desc")]
    Desc,
}

impl SortDirection {
    pub fn is_descending(&self) -> bool {
        matches!(self, SortDirection::Desc)
    }

    /// Numeric direction used by document stores
    pub fn numeric(&self) -> i8 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortField {
    pub field: String,
    pub direction: SortDirection,
}

/// Sort map whose insertion order is the tie-break order.
///
/// Serialized as a JSON object; deserialization keeps key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SortSpec(Vec<SortField>);

impl SortSpec {
    pub fn push(&mut self, field: impl Into<String>, direction: SortDirection) {
        let field = field.into();
        // A repeated key replaces the earlier direction but keeps its position
        if let Some(existing) = self.0.iter_mut().find(|s| s.field == field) {
            existing.direction = direction;
        } else {
            self.0.push(SortField { field, direction });
        }
    }

    pub fn fields(&self) -> &[SortField] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for SortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for entry in &self.0 {
            map.serialize_entry(&entry.field, &entry.direction)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SortVisitor;

        impl<'de> Visitor<'de> for SortVisitor {
            type Value = SortSpec;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of field names to ASC or DESC")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<SortSpec, A::Error> {
                let mut spec = SortSpec::default();
                while let Some((field, direction)) =
                    access.next_entry::<String, SortDirection>()?
                {
                    spec.push(field, direction);
                }
                Ok(spec)
            }
        }

        deserializer.deserialize_map(SortVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u64,
    pub limit: u64,
}

impl Pagination {
    pub fn new(page: u64, limit: u64) -> Self {
        Self { page, limit }
    }

    pub fn skip(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }

    pub fn total_pages(&self, total: u64) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        total.div_ceil(self.limit)
    }

    pub fn has_next(&self, total: u64) -> bool {
        self.page.saturating_mul(self.limit) < total
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSpec {
    pub term: String,
    pub fields: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("Page must be a positive integer, got {0}")]
    InvalidPage(u64),

    #[error("Limit must be a positive integer, got {0}")]
    InvalidLimit(u64),

    #[error("Search fields must not be blank")]
    InvalidSearchField,

    #[error("Invalid descriptor JSON: {0}")]
    Json(#[from] serde_json::Error),
}
