//! Explicit entity metadata.
//!
//! Entities declare their fields up front instead of being reflected at
//! runtime. A field is a relation when it references another entity, holds an
//! array of references, or embeds a sub-schema.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::data::DataType;

/// Declared schema of an entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Entity (table / collection) name
    pub name: String,
    /// Primary key field, used for default ordering and partitioning
    pub primary_key: String,
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: "id".to_string(),
            fields: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = primary_key.into();
        self
    }

    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A single declared field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDef {
    pub fn scalar(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Scalar(data_type),
        }
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Reference {
                target: target.into(),
            },
        }
    }

    pub fn reference_array(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::ReferenceArray {
                target: target.into(),
            },
        }
    }

    pub fn embedded(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Embedded { fields },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldKind {
    Scalar(DataType),
    /// Holds the primary key of one `target` entity
    Reference { target: String },
    /// Holds an array of primary keys of `target` entities
    ReferenceArray { target: String },
    /// Nested sub-document stored inline
    Embedded { fields: Vec<FieldDef> },
}

/// Cardinality kind of a relation field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Reference,
    ReferenceArray,
    Embedded,
}

impl FieldKind {
    pub fn relation_kind(&self) -> Option<RelationKind> {
        match self {
            FieldKind::Scalar(_) => None,
            FieldKind::Reference { .. } => Some(RelationKind::Reference),
            FieldKind::ReferenceArray { .. } => Some(RelationKind::ReferenceArray),
            FieldKind::Embedded { .. } => Some(RelationKind::Embedded),
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            FieldKind::Reference { target } | FieldKind::ReferenceArray { target } => {
                Some(target)
            }
            _ => None,
        }
    }
}

/// Source of entity schemas consulted during relation discovery
pub trait SchemaSource: Send + Sync {
    fn describe(&self, entity: &str) -> Result<EntitySchema, SchemaError>;
}

/// In-process schema registry
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: DashMap<String, Arc<EntitySchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schema: EntitySchema) {
        self.schemas.insert(schema.name.clone(), Arc::new(schema));
    }

    pub fn get(&self, entity: &str) -> Option<Arc<EntitySchema>> {
        self.schemas.get(entity).map(|s| Arc::clone(&s))
    }

    pub fn entities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl SchemaSource for SchemaRegistry {
    fn describe(&self, entity: &str) -> Result<EntitySchema, SchemaError> {
        let schema = self
            .get(entity)
            .ok_or_else(|| SchemaError::UnknownEntity(entity.to_string()))?;
        if schema.fields.iter().any(|f| f.name.is_empty()) {
            return Err(SchemaError::Malformed {
                entity: entity.to_string(),
                reason: "field with empty name".to_string(),
            });
        }
        Ok(schema.as_ref().clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Entity '{0}' has no declared schema")]
    UnknownEntity(String),

    #[error("Schema for '{entity}' is malformed: {reason}")]
    Malformed { entity: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_describe() {
        let registry = SchemaRegistry::new();
        registry.register(
            EntitySchema::new("users")
                .with_field(FieldDef::scalar("name", DataType::String))
                .with_field(FieldDef::reference("company", "companies")),
        );

        let schema = registry.describe("users").unwrap();
        assert_eq!(schema.primary_key, "id");
        assert_eq!(
            schema.field("company").unwrap().kind.relation_kind(),
            Some(RelationKind::Reference)
        );
        assert!(registry.describe("missing").is_err());
    }

    #[test]
    fn test_malformed_schema_is_rejected() {
        let registry = SchemaRegistry::new();
        registry.register(EntitySchema::new("broken").with_field(FieldDef::scalar("", DataType::Int64)));
        assert!(matches!(
            registry.describe("broken"),
            Err(SchemaError::Malformed { .. })
        ));
    }
}
