//! Predicate evaluation over in-memory rows and documents.
//!
//! Comparisons follow SQL three-valued logic collapsed to `false`: any
//! comparison against a missing or null value fails, except the null checks.
//! Range operators only match within one type bracket.

use moka::sync::Cache;
use regex::{Regex, RegexBuilder};
use std::sync::{Arc, OnceLock};

use super::partitioner::partition_of;
use crate::data::{value_at, Record, Value};
use crate::document::MatchExpr;
use crate::query::filter::FilterOperator;
use crate::query::search::like_to_regex;
use crate::relational::{ColumnRef, Predicate};

const REGEX_CACHE_CAPACITY: u64 = 1_024;

fn regex_cache() -> &'static Cache<(String, bool), Option<Arc<Regex>>> {
    static CACHE: OnceLock<Cache<(String, bool), Option<Arc<Regex>>>> = OnceLock::new();
    CACHE.get_or_init(|| Cache::new(REGEX_CACHE_CAPACITY))
}

/// Compiled regex for a pattern; invalid patterns never match
fn compiled(pattern: &str, case_insensitive: bool) -> Option<Arc<Regex>> {
    regex_cache().get_with((pattern.to_string(), case_insensitive), || {
        match RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
        {
            Ok(re) => Some(Arc::new(re)),
            Err(e) => {
                tracing::warn!("Invalid pattern '{}': {}", pattern, e);
                None
            }
        }
    })
}

pub fn regex_match(value: &Value, pattern: &str, case_insensitive: bool) -> bool {
    match (value.as_str(), compiled(pattern, case_insensitive)) {
        (Some(text), Some(re)) => re.is_match(text),
        _ => false,
    }
}

/// SQL LIKE (`%`, `_`, `\` escapes); ILIKE when `case_insensitive`
pub fn like_match(value: &Value, pattern: &str, case_insensitive: bool) -> bool {
    regex_match(value, &like_to_regex(pattern), case_insensitive)
}

/// Apply one filter operator; `right` is an array for IN / NOT IN
pub fn compare(op: FilterOperator, left: &Value, right: &Value) -> bool {
    match op {
        FilterOperator::IsNull => left.is_null(),
        FilterOperator::IsNotNull => !left.is_null(),
        FilterOperator::NotIn if right.as_array().is_some_and(|values| values.is_empty()) => true,
        _ if left.is_null() => false,
        FilterOperator::Eq => left == right,
        FilterOperator::NotEq => !right.is_null() && left != right,
        FilterOperator::Lt => left.same_bracket(right) && left < right,
        FilterOperator::LtEq => left.same_bracket(right) && left <= right,
        FilterOperator::Gt => left.same_bracket(right) && left > right,
        FilterOperator::GtEq => left.same_bracket(right) && left >= right,
        FilterOperator::In => right.as_array().is_some_and(|values| values.contains(left)),
        FilterOperator::NotIn => right.as_array().is_some_and(|values| !values.contains(left)),
        FilterOperator::Like => right
            .as_str()
            .is_some_and(|pattern| like_match(left, pattern, false)),
    }
}

/// Evaluate a `$match` expression against a document
pub fn matches(expr: &MatchExpr, row: &Record) -> bool {
    match expr {
        MatchExpr::Field { path, op, value } => compare(*op, &value_at(row, path), value),
        MatchExpr::Regex {
            path,
            pattern,
            case_insensitive,
        } => regex_match(&value_at(row, path), pattern, *case_insensitive),
        MatchExpr::And(items) => items.iter().all(|m| matches(m, row)),
        MatchExpr::Or(items) => items.iter().any(|m| matches(m, row)),
        MatchExpr::Partition {
            path,
            partitions,
            index,
        } => partition_of(&value_at(row, path), *partitions) == *index,
    }
}

/// Evaluate a relational predicate; `column` resolves a column against the current row
pub fn predicate_holds<F>(predicate: &Predicate, params: &[Value], column: &F) -> bool
where
    F: Fn(&ColumnRef) -> Value,
{
    let param = |i: usize| params.get(i).cloned().unwrap_or(Value::Null);
    match predicate {
        Predicate::Compare {
            column: col,
            op,
            param: p,
        } => compare(*op, &column(col), &param(*p)),
        Predicate::InList {
            column: col,
            params: ps,
            negated,
        } => {
            let value = column(col);
            if value.is_null() {
                return ps.is_empty() && *negated;
            }
            let found = ps.iter().any(|p| param(*p) == value);
            found != *negated
        }
        Predicate::Like {
            column: col,
            param: p,
            case_insensitive,
        } => match param(*p).as_str() {
            Some(pattern) => like_match(&column(col), pattern, *case_insensitive),
            None => false,
        },
        Predicate::IsNull {
            column: col,
            negated,
        } => column(col).is_null() != *negated,
        Predicate::Any(items) => {
            items.is_empty() || items.iter().any(|p| predicate_holds(p, params, column))
        }
        Predicate::All(items) => items.iter().all(|p| predicate_holds(p, params, column)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_comparisons_fail() {
        assert!(!compare(FilterOperator::Eq, &Value::Null, &Value::from("x")));
        assert!(!compare(FilterOperator::NotEq, &Value::Null, &Value::from("x")));
        assert!(compare(FilterOperator::IsNull, &Value::Null, &Value::Null));
        assert!(!compare(FilterOperator::Gt, &Value::from("a"), &Value::Int64(1)));
        assert!(compare(FilterOperator::Gt, &Value::Float64(2.5), &Value::Int64(2)));
    }

    #[test]
    fn test_like() {
        let name = Value::from("Ada Lovelace");
        assert!(like_match(&name, "Ada%", false));
        assert!(!like_match(&name, "ada%", false));
        assert!(like_match(&name, "ada%", true));
        assert!(like_match(&name, "%Lovelac_", false));
        assert!(!like_match(&Value::from("100"), "1\\%", false));
        assert!(like_match(&Value::from("1%"), "1\\%", false));
    }

    #[test]
    fn test_invalid_regex_never_matches() {
        assert!(!regex_match(&Value::from("abc"), "(", false));
    }

    #[test]
    fn test_match_expr() {
        let mut row = Record::new();
        row.insert("status".into(), Value::from("ACTIVE"));
        row.insert("age".into(), Value::Int64(30));
        let expr = MatchExpr::And(vec![
            MatchExpr::Field {
                path: "status".into(),
                op: FilterOperator::Eq,
                value: Value::from("ACTIVE"),
            },
            MatchExpr::Or(vec![
                MatchExpr::Field {
                    path: "age".into(),
                    op: FilterOperator::Lt,
                    value: Value::Int64(18),
                },
                MatchExpr::Regex {
                    path: "status".into(),
                    pattern: "^act".into(),
                    case_insensitive: true,
                },
            ]),
        ]);
        assert!(matches(&expr, &row));
    }

    #[test]
    fn test_in_list_predicate() {
        let params = vec![Value::Int64(1), Value::Int64(2)];
        let predicate = Predicate::InList {
            column: ColumnRef::bare("id"),
            params: vec![0, 1],
            negated: true,
        };
        assert!(predicate_holds(&predicate, &params, &|_| Value::Int64(3)));
        assert!(!predicate_holds(&predicate, &params, &|_| Value::Int64(2)));
        assert!(!predicate_holds(&predicate, &params, &|_| Value::Null));
        assert!(compare(FilterOperator::NotIn, &Value::Null, &Value::Array(Vec::new())));
    }
}
