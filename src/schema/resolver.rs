//! Deep relation path resolution.
//!
//! Each requested path becomes its own right-nested population chain:
//! `a.b.c` resolves to `a -> b -> c`. Paths sharing a prefix are not merged,
//! so `business.owner` and `business.contact` produce two `business` roots.

use serde::{Deserialize, Serialize};

use super::catalog::RelationCatalog;

/// One step of a population chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PopulateNode {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<Box<PopulateNode>>,
}

impl PopulateNode {
    /// Build the chain for a dotted path; `None` for paths with blank segments
    pub fn from_path(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.trim().is_empty()) {
            return None;
        }
        let mut node: Option<PopulateNode> = None;
        for segment in segments.into_iter().rev() {
            node = Some(PopulateNode {
                path: segment.to_string(),
                then: node.map(Box::new),
            });
        }
        node
    }

    pub fn depth(&self) -> usize {
        1 + self.then.as_ref().map(|t| t.depth()).unwrap_or(0)
    }

    /// Dotted form of the chain
    pub fn dotted(&self) -> String {
        match &self.then {
            Some(next) => format!("{}.{}", self.path, next.dotted()),
            None => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A requested relation that could not be loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationError {
    pub relation: String,
    pub error: String,
    pub severity: Severity,
}

impl RelationError {
    pub fn warning(relation: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            error: error.into(),
            severity: Severity::Warning,
        }
    }
}

/// Outcome of resolving a list of relation paths
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationResolution {
    pub populate: Vec<PopulateNode>,
    pub valid_relations: Vec<String>,
    pub failed_relations: Vec<RelationError>,
}

impl RelationResolution {
    pub fn is_empty(&self) -> bool {
        self.populate.is_empty() && self.failed_relations.is_empty()
    }
}

/// Resolve relation paths for `entity` against the catalog
pub fn resolve_relations<S: AsRef<str>>(
    catalog: &RelationCatalog,
    entity: &str,
    paths: &[S],
) -> RelationResolution {
    let mut resolution = RelationResolution::default();
    if paths.is_empty() {
        return resolution;
    }

    let entry = catalog.entry(entity);
    let mut seen = std::collections::HashSet::new();

    for path in paths {
        let path = path.as_ref().trim();
        if !seen.insert(path.to_string()) {
            continue;
        }

        let Some(node) = PopulateNode::from_path(path) else {
            resolution
                .failed_relations
                .push(RelationError::warning(path, "Relation path has an empty segment"));
            continue;
        };

        if entry.trie().contains_root(&node.path) {
            resolution.valid_relations.push(path.to_string());
            resolution.populate.push(node);
        } else {
            resolution.failed_relations.push(RelationError::warning(
                path,
                format!("Unknown relation '{}' on '{}'", node.path, entity),
            ));
        }
    }

    if !resolution.failed_relations.is_empty() {
        tracing::debug!(
            "{} of {} relation paths rejected for '{}'",
            resolution.failed_relations.len(),
            paths.len(),
            entity
        );
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataType;
    use crate::schema::entity::{EntitySchema, FieldDef, SchemaRegistry};
    use std::sync::Arc;

    fn catalog() -> RelationCatalog {
        let registry = SchemaRegistry::new();
        registry.register(
            EntitySchema::new("orders")
                .with_field(FieldDef::scalar("status", DataType::String))
                .with_field(FieldDef::reference("business", "businesses"))
                .with_field(FieldDef::reference("customer", "users")),
        );
        RelationCatalog::new(Arc::new(registry))
    }

    #[test]
    fn test_right_nested_chain() {
        let node = PopulateNode::from_path("a.b.c").unwrap();
        assert_eq!(node.path, "a");
        let b = node.then.as_ref().unwrap();
        assert_eq!(b.path, "b");
        assert_eq!(b.then.as_ref().unwrap().path, "c");
        assert!(b.then.as_ref().unwrap().then.is_none());
        assert_eq!(node.depth(), 3);
        assert_eq!(node.dotted(), "a.b.c");
    }

    #[test]
    fn test_partitions_valid_and_failed() {
        let resolution = resolve_relations(
            &catalog(),
            "orders",
            &["business.owner.company", "warehouse.zone", "customer"],
        );

        assert_eq!(
            resolution.valid_relations,
            vec!["business.owner.company", "customer"]
        );
        assert_eq!(resolution.failed_relations.len(), 1);
        assert_eq!(resolution.failed_relations[0].relation, "warehouse.zone");
        assert_eq!(resolution.failed_relations[0].severity, Severity::Warning);
        assert!(resolution.populate.iter().all(|n| n.path != "warehouse"));
    }

    #[test]
    fn test_shared_prefixes_are_not_merged() {
        let resolution = resolve_relations(
            &catalog(),
            "orders",
            &["business.owner", "business.contact"],
        );
        assert_eq!(resolution.populate.len(), 2);
        assert!(resolution.populate.iter().all(|n| n.path == "business"));
    }

    #[test]
    fn test_blank_segments_and_duplicates() {
        let resolution =
            resolve_relations(&catalog(), "orders", &["business..owner", "customer", "customer"]);
        assert_eq!(resolution.valid_relations, vec!["customer"]);
        assert_eq!(resolution.populate.len(), 1);
        assert_eq!(resolution.failed_relations[0].relation, "business..owner");
    }
}
