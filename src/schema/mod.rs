pub mod catalog;
pub mod entity;
pub mod resolver;

pub use catalog::{CatalogEntry, PathTrie, RelationCatalog, RelationInfo};
pub use entity::{
    EntitySchema, FieldDef, FieldKind, RelationKind, SchemaError, SchemaRegistry, SchemaSource,
};
pub use resolver::{resolve_relations, PopulateNode, RelationError, RelationResolution, Severity};
