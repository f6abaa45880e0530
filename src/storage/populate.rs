//! Relation population for the in-memory backends.
//!
//! Reference ids are replaced by the referenced records, following each
//! chain segment by segment. A segment the schema does not declare is a soft
//! failure reported once per requested path.

use std::collections::HashMap;
use std::sync::Arc;

use super::engine::MemoryStore;
use crate::data::{Record, Value};
use crate::execution::Populated;
use crate::schema::{EntitySchema, FieldDef, FieldKind, PopulateNode, RelationError};

/// Primary-key indexes of referenced entities, built on first use
struct Targets<'s> {
    store: &'s MemoryStore,
    indexes: HashMap<String, HashMap<Value, Record>>,
}

impl<'s> Targets<'s> {
    fn new(store: &'s MemoryStore) -> Self {
        Self {
            store,
            indexes: HashMap::new(),
        }
    }

    fn schema(&self, entity: &str) -> Option<Arc<EntitySchema>> {
        self.store.schemas().get(entity)
    }

    fn get(&mut self, entity: &str, id: &Value) -> Option<Record> {
        if !self.indexes.contains_key(entity) {
            let primary_key = self
                .schema(entity)
                .map(|s| s.primary_key.clone())
                .unwrap_or_else(|| "id".to_string());
            let index = self
                .store
                .scan(entity)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|r| r.get(&primary_key).cloned().map(|k| (k, r)))
                .collect();
            self.indexes.insert(entity.to_string(), index);
        }
        self.indexes.get(entity).and_then(|index| index.get(id).cloned())
    }
}

pub fn populate(
    store: &MemoryStore,
    entity: &str,
    mut records: Vec<Record>,
    relations: &[PopulateNode],
) -> Populated {
    let mut relation_errors = Vec::new();
    if relations.is_empty() || records.is_empty() {
        return Populated {
            records,
            relation_errors,
        };
    }

    let fields = store
        .schemas()
        .get(entity)
        .map(|s| s.fields.clone())
        .unwrap_or_default();
    let mut targets = Targets::new(store);

    for node in relations {
        let mut failure: Option<String> = None;
        for record in records.iter_mut() {
            populate_node(record, &fields, entity, node, &mut targets, &mut failure);
        }
        if let Some(error) = failure {
            tracing::debug!("Relation '{}' on '{}' not loaded: {}", node.dotted(), entity, error);
            relation_errors.push(RelationError::warning(node.dotted(), error));
        }
    }

    Populated {
        records,
        relation_errors,
    }
}

fn populate_node(
    record: &mut Record,
    fields: &[FieldDef],
    owner: &str,
    node: &PopulateNode,
    targets: &mut Targets<'_>,
    failure: &mut Option<String>,
) {
    let Some(field) = fields.iter().find(|f| f.name == node.path) else {
        failure.get_or_insert_with(|| format!("Unknown relation '{}' on '{}'", node.path, owner));
        return;
    };

    match &field.kind {
        FieldKind::Scalar(_) => {
            failure.get_or_insert_with(|| {
                format!("Field '{}' on '{}' is not a relation", node.path, owner)
            });
        }
        FieldKind::Reference { target } => match record.get_mut(&node.path) {
            // Loaded by an earlier chain sharing this prefix
            Some(Value::Object(loaded)) => descend(loaded, target, node, targets, failure),
            Some(id) => {
                let id = id.clone();
                if let Some(loaded) = load(&id, target, node, targets, failure) {
                    record.insert(node.path.clone(), Value::Object(loaded));
                }
            }
            None => {}
        },
        FieldKind::ReferenceArray { target } => {
            let Some(Value::Array(ids)) = record.get(&node.path).cloned() else {
                return;
            };
            let loaded: Vec<Value> = ids
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(mut loaded) => {
                        descend(&mut loaded, target, node, targets, failure);
                        Some(loaded)
                    }
                    id => load(&id, target, node, targets, failure),
                })
                .map(Value::Object)
                .collect();
            record.insert(node.path.clone(), Value::Array(loaded));
        }
        FieldKind::Embedded { fields: inner } => {
            let Some(next) = &node.then else {
                return;
            };
            let scope = format!("{}.{}", owner, node.path);
            match record.get_mut(&node.path) {
                Some(Value::Object(embedded)) => {
                    populate_node(embedded, inner, &scope, next, targets, failure)
                }
                Some(Value::Array(items)) => {
                    for item in items.iter_mut() {
                        if let Value::Object(embedded) = item {
                            populate_node(embedded, inner, &scope, next, targets, failure);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Load one referenced record and continue the chain on it
fn load(
    id: &Value,
    target: &str,
    node: &PopulateNode,
    targets: &mut Targets<'_>,
    failure: &mut Option<String>,
) -> Option<Record> {
    let mut loaded = targets.get(target, id)?;
    descend(&mut loaded, target, node, targets, failure);
    Some(loaded)
}

/// Continue the chain below `node` on an already loaded record
fn descend(
    loaded: &mut Record,
    target: &str,
    node: &PopulateNode,
    targets: &mut Targets<'_>,
    failure: &mut Option<String>,
) {
    if let Some(next) = &node.then {
        let fields = targets
            .schema(target)
            .map(|s| s.fields.clone())
            .unwrap_or_default();
        populate_node(loaded, &fields, target, next, targets, failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{value_at, DataType};
    use serde_json::json;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.define(
            EntitySchema::new("orders")
                .with_field(FieldDef::scalar("status", DataType::String))
                .with_field(FieldDef::reference("customer", "users"))
                .with_field(FieldDef::reference_array("items", "products"))
                .with_field(FieldDef::embedded(
                    "shipping",
                    vec![FieldDef::reference("carrier", "carriers")],
                )),
        );
        store.define(
            EntitySchema::new("users").with_field(FieldDef::reference("address", "addresses")),
        );
        store.define(EntitySchema::new("addresses"));
        store.define(EntitySchema::new("products"));
        store.define(EntitySchema::new("carriers"));
        store.insert_json("users", &[json!({"id": 7, "name": "Ada", "address": 70})]);
        store.insert_json("addresses", &[json!({"id": 70, "city": "Lyon"})]);
        store.insert_json("products", &[json!({"id": 1, "sku": "A"}), json!({"id": 2, "sku": "B"})]);
        store.insert_json("carriers", &[json!({"id": 5, "name": "Post"})]);
        store
    }

    fn order() -> Record {
        crate::data::record_from_json(&json!({
            "id": 100,
            "status": "NEW",
            "customer": 7,
            "items": [1, 2, 3],
            "shipping": {"carrier": 5}
        }))
        .unwrap()
    }

    fn chains(paths: &[&str]) -> Vec<PopulateNode> {
        paths.iter().filter_map(|p| PopulateNode::from_path(p)).collect()
    }

    #[test]
    fn test_deep_reference_chain() {
        let store = store();
        let out = populate(&store, "orders", vec![order()], &chains(&["customer.address"]));
        assert!(out.relation_errors.is_empty());
        assert_eq!(value_at(&out.records[0], "customer.address.city"), Value::from("Lyon"));
    }

    #[test]
    fn test_reference_array_and_embedded() {
        let store = store();
        let out = populate(
            &store,
            "orders",
            vec![order()],
            &chains(&["items", "shipping.carrier"]),
        );
        let items = out.records[0]["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(value_at(&out.records[0], "shipping.carrier.name"), Value::from("Post"));
    }

    #[test]
    fn test_overlapping_chains_extend_loaded_record() {
        let store = store();
        let out = populate(
            &store,
            "orders",
            vec![order()],
            &chains(&["customer", "customer.address"]),
        );
        assert!(out.relation_errors.is_empty());
        assert_eq!(value_at(&out.records[0], "customer.address.city"), Value::from("Lyon"));
    }

    #[test]
    fn test_unknown_deep_segment_is_soft() {
        let store = store();
        let out = populate(
            &store,
            "orders",
            vec![order(), order()],
            &chains(&["customer.employer", "status"]),
        );
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.relation_errors.len(), 2);
        assert_eq!(out.relation_errors[0].relation, "customer.employer");
        assert!(out.relation_errors[1].error.contains("not a relation"));
        assert_eq!(value_at(&out.records[0], "customer.name"), Value::from("Ada"));
    }
}
