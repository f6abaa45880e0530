//! Relation catalog with per-entity discovery caching
//!
//! Discovery runs once per entity type; results live for the lifetime of the
//! process. Concurrent first access for the same entity converges on a single
//! cached entry.

use moka::sync::Cache;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::entity::{EntitySchema, FieldDef, FieldKind, RelationKind, SchemaSource};

/// Fields always excluded from relation discovery
const DEFAULT_RESERVED: &[&str] = &["__v", "_id"];

/// Known relation on an entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    pub kind: RelationKind,
    /// Referenced entity; `None` for embedded sub-schemas
    pub target: Option<String>,
}

/// Segment prefix tree over relation paths
#[derive(Debug, Default, Clone)]
pub struct PathTrie {
    children: HashMap<String, PathTrie>,
}

impl PathTrie {
    fn insert_child(&mut self, segment: &str) -> &mut PathTrie {
        self.children.entry(segment.to_string()).or_default()
    }

    pub fn contains_root(&self, segment: &str) -> bool {
        self.children.contains_key(segment)
    }

    /// Number of leading segments of `path` present in the tree
    pub fn known_depth(&self, path: &str) -> usize {
        let mut node = self;
        let mut depth = 0;
        for segment in path.split('.') {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    depth += 1;
                }
                None => break,
            }
        }
        depth
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Immutable result of discovering one entity's relations
#[derive(Debug, Clone, Default)]
pub struct CatalogEntry {
    pub entity: String,
    pub primary_key: String,
    relations: BTreeMap<String, RelationInfo>,
    trie: PathTrie,
}

impl CatalogEntry {
    fn empty(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            primary_key: "id".to_string(),
            ..Default::default()
        }
    }

    fn from_schema(schema: &EntitySchema, reserved: &[String]) -> Self {
        let mut relations = BTreeMap::new();
        let mut trie = PathTrie::default();

        for field in &schema.fields {
            if is_reserved(&field.name, reserved) {
                continue;
            }
            let Some(kind) = field.kind.relation_kind() else {
                continue;
            };
            relations.insert(
                field.name.clone(),
                RelationInfo {
                    kind,
                    target: field.kind.target().map(str::to_string),
                },
            );
            let node = trie.insert_child(&field.name);
            if let FieldKind::Embedded { fields } = &field.kind {
                insert_embedded(node, fields, reserved);
            }
        }

        Self {
            entity: schema.name.clone(),
            primary_key: schema.primary_key.clone(),
            relations,
            trie,
        }
    }

    pub fn relation_names(&self) -> BTreeSet<String> {
        self.relations.keys().cloned().collect()
    }

    pub fn relation(&self, root: &str) -> Option<&RelationInfo> {
        self.relations.get(root)
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn trie(&self) -> &PathTrie {
        &self.trie
    }
}

fn insert_embedded(node: &mut PathTrie, fields: &[FieldDef], reserved: &[String]) {
    for field in fields {
        if is_reserved(&field.name, reserved) || field.kind.relation_kind().is_none() {
            continue;
        }
        let child = node.insert_child(&field.name);
        if let FieldKind::Embedded { fields } = &field.kind {
            insert_embedded(child, fields, reserved);
        }
    }
}

fn is_reserved(name: &str, reserved: &[String]) -> bool {
    name.starts_with('_') || reserved.iter().any(|r| r == name)
}

/// Process-wide relation catalog
pub struct RelationCatalog {
    source: Arc<dyn SchemaSource>,
    entries: Cache<String, Arc<CatalogEntry>>,
    reserved: Vec<String>,
}

impl RelationCatalog {
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source,
            entries: Cache::builder().build(),
            reserved: DEFAULT_RESERVED.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Add field names excluded from discovery
    pub fn with_reserved<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reserved.extend(names.into_iter().map(Into::into));
        self
    }

    /// Catalog entry for an entity, discovering it on first access
    pub fn entry(&self, entity: &str) -> Arc<CatalogEntry> {
        self.entries
            .get_with(entity.to_string(), || Arc::new(self.discover(entity)))
    }

    fn discover(&self, entity: &str) -> CatalogEntry {
        match self.source.describe(entity) {
            Ok(schema) => {
                let entry = CatalogEntry::from_schema(&schema, &self.reserved);
                tracing::debug!(
                    "Discovered {} relations for '{}'",
                    entry.relations.len(),
                    entity
                );
                entry
            }
            Err(e) => {
                tracing::warn!("Relation discovery failed for '{}': {}", entity, e);
                CatalogEntry::empty(entity)
            }
        }
    }

    pub fn relations_for(&self, entity: &str) -> BTreeSet<String> {
        self.entry(entity).relation_names()
    }

    pub fn is_valid_root(&self, entity: &str, root: &str) -> bool {
        self.entry(entity).trie.contains_root(root)
    }

    /// Only the root segment is checked; deeper segments are the backend's concern
    pub fn is_valid_path(&self, entity: &str, path: &str) -> bool {
        let root = path.split('.').next().unwrap_or_default();
        !root.is_empty() && self.is_valid_root(entity, root)
    }

    /// Validate many paths against one catalog lookup
    pub fn validate_batch<S: AsRef<str>>(&self, entity: &str, paths: &[S]) -> Vec<bool> {
        let entry = self.entry(entity);
        paths
            .iter()
            .map(|p| {
                let root = p.as_ref().split('.').next().unwrap_or_default();
                entry.trie.contains_root(root)
            })
            .collect()
    }

    pub fn known_depth(&self, entity: &str, path: &str) -> usize {
        self.entry(entity).trie.known_depth(path)
    }

    pub fn relation(&self, entity: &str, root: &str) -> Option<RelationInfo> {
        self.entry(entity).relation(root).cloned()
    }

    pub fn primary_key(&self, entity: &str) -> String {
        self.entry(entity).primary_key.clone()
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }
}
