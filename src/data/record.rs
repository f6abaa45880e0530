use std::collections::BTreeMap;

use super::Value;

/// A relational row or a document, keyed by field name
pub type Record = BTreeMap<String, Value>;

/// Resolve a dot-separated path inside a record.
///
/// Intermediate arrays are not traversed; a path through an array yields `None`.
pub fn get_path<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = record.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Like [`get_path`] but returns `Value::Null` for missing paths
pub fn value_at(record: &Record, path: &str) -> Value {
    get_path(record, path).cloned().unwrap_or(Value::Null)
}

/// Set a value at a dot-separated path, creating intermediate objects
pub fn set_path(record: &mut Record, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            record.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = record
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(BTreeMap::new()));
            if !matches!(entry, Value::Object(_)) {
                *entry = Value::Object(BTreeMap::new());
            }
            if let Value::Object(child) = entry {
                set_path(child, rest, value);
            }
        }
    }
}

/// Build a record from a JSON object; non-object input yields `None`
pub fn record_from_json(json: &serde_json::Value) -> Option<Record> {
    match Value::from_json(json) {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

pub fn record_to_json(record: &Record) -> serde_json::Value {
    serde_json::Value::Object(
        record
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Stable multi-key sort; `keys` are `(path, descending)` pairs in tie-break order.
/// Missing values sort as `Null`, which is lowest.
pub fn sort_records(records: &mut [Record], keys: &[(String, bool)]) {
    if keys.is_empty() {
        return;
    }
    records.sort_by(|a, b| {
        for (path, descending) in keys {
            let left = get_path(a, path).unwrap_or(&Value::Null);
            let right = get_path(b, path).unwrap_or(&Value::Null);
            let ord = left.cmp(right);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

/// Approximate byte size of a set of records
pub fn approx_records_size(records: &[Record]) -> usize {
    records
        .iter()
        .map(|r| {
            r.iter()
                .map(|(k, v)| k.len() + v.approx_size())
                .sum::<usize>()
                + 16
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_set_path() {
        let mut record = Record::new();
        set_path(&mut record, "owner.address.city", Value::from("Lyon"));
        set_path(&mut record, "id", Value::Int64(1));

        assert_eq!(
            get_path(&record, "owner.address.city"),
            Some(&Value::String("Lyon".into()))
        );
        assert_eq!(value_at(&record, "owner.missing"), Value::Null);
        assert!(get_path(&record, "id.nested").is_none());
    }

    #[test]
    fn test_sort_records_multi_key() {
        let mut records: Vec<Record> = [("b", 1), ("a", 1), ("c", 2)]
            .iter()
            .map(|(name, rank)| {
                let mut r = Record::new();
                r.insert("name".into(), Value::from(*name));
                r.insert("rank".into(), Value::Int64(*rank));
                r
            })
            .collect();
        sort_records(
            &mut records,
            &[("rank".to_string(), true), ("name".to_string(), false)],
        );
        let names: Vec<String> = records.iter().map(|r| r["name"].to_string()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_record_from_json_rejects_scalars() {
        assert!(record_from_json(&serde_json::json!(1)).is_none());
        let record = record_from_json(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(record["a"], Value::Int64(1));
    }
}
