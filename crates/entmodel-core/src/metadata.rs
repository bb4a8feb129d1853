//! Entity metadata and the resolution pass.
//!
//! Entities are declared with [`EntityMetadata`] builders that name their
//! relation targets by string. [`RegistryBuilder::build`] resolves every
//! declaration in one pass: it checks identifiers, flattens single-table
//! inheritance, resolves relation targets and inverse sides, and fills in
//! default join columns and pivot tables. Sessions are only ever constructed
//! from a resolved [`MetadataRegistry`], so an unresolved relation is a
//! construction-time error instead of a failure deep inside a flush.
//!
//! # Example
//!
//! ```ignore
//! let registry = MetadataRegistry::builder()
//!     .entity(
//!         EntityMetadata::new("Author")
//!             .property(PropertyMetadata::new("id", PropertyType::BigInt).primary_key(true).auto_increment(true))
//!             .property(PropertyMetadata::new("name", PropertyType::Text))
//!             .relation(RelationMetadata::one_to_many("books", "Book", "author").cascade(Cascade::ALL)),
//!     )
//!     .entity(
//!         EntityMetadata::new("Book")
//!             .property(PropertyMetadata::new("id", PropertyType::BigInt).primary_key(true).auto_increment(true))
//!             .relation(RelationMetadata::many_to_one("author", "Author")),
//!     )
//!     .build()?;
//! ```

use crate::error::{Error, MetadataErrorKind};
use crate::types::{CustomType, PropertyType};
use crate::value::Value;
use crate::Result;
use regex::Regex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// A scalar property of an entity.
#[derive(Debug, Clone)]
pub struct PropertyMetadata {
    /// Property name as used on the entity
    pub name: String,
    /// Column name (defaults to the property name)
    pub column: String,
    /// Semantic type
    pub property_type: PropertyType,
    /// Whether NULL is allowed
    pub nullable: bool,
    /// Value written on insert when the property is unset
    pub default: Option<Value>,
    /// Part of the primary key
    pub primary_key: bool,
    /// Database assigns the value on insert (auto-increment keys)
    pub auto_increment: bool,
    /// Database fills the value (server default or computed column)
    pub generated: bool,
    /// Optimistic-lock version column
    pub version: bool,
    /// Not loaded unless requested
    pub lazy: bool,
    /// Pluggable comparison and conversion
    pub custom_type: Option<Arc<dyn CustomType>>,
}

impl PropertyMetadata {
    /// Create a new property with the given name and type.
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            property_type,
            nullable: false,
            default: None,
            primary_key: false,
            auto_increment: false,
            generated: false,
            version: false,
            lazy: false,
            custom_type: None,
        }
    }

    /// Set the column name.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Allow NULL.
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set the insert default.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Mark as part of the primary key.
    pub fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Mark as database-assigned on insert.
    pub fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    /// Mark as filled by the database.
    pub fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    /// Mark as the optimistic-lock version.
    pub fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }

    /// Mark as lazily loaded.
    pub fn lazy(mut self, value: bool) -> Self {
        self.lazy = value;
        self
    }

    /// Attach a custom type.
    pub fn custom_type(mut self, custom: Arc<dyn CustomType>) -> Self {
        self.custom_type = Some(custom);
        self
    }

    /// Compare two values using the custom type if one is attached, otherwise
    /// the semantic type's default equality.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match &self.custom_type {
            Some(custom) => custom.compare(a, b),
            None => self.property_type.values_equal(a, b),
        }
    }

    /// Convert an in-memory value for binding into a statement.
    #[allow(clippy::result_large_err)]
    pub fn to_database(&self, value: &Value) -> Result<Value> {
        match &self.custom_type {
            Some(custom) => custom.to_database(value),
            None => Ok(value.clone()),
        }
    }

    /// Convert a database value for hydration.
    #[allow(clippy::result_large_err)]
    pub fn from_database(&self, value: &Value) -> Result<Value> {
        match &self.custom_type {
            Some(custom) => custom.from_database(value),
            None => Ok(value.clone()),
        }
    }

    /// Whether the database supplies this value when the entity leaves it unset.
    pub fn database_supplied(&self) -> bool {
        self.auto_increment || self.generated
    }
}

/// Cascade rules on a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cascade {
    pub persist: bool,
    pub remove: bool,
    pub merge: bool,
}

impl Cascade {
    pub const NONE: Cascade = Cascade {
        persist: false,
        remove: false,
        merge: false,
    };
    pub const PERSIST: Cascade = Cascade {
        persist: true,
        remove: false,
        merge: false,
    };
    pub const REMOVE: Cascade = Cascade {
        persist: false,
        remove: true,
        merge: false,
    };
    pub const MERGE: Cascade = Cascade {
        persist: false,
        remove: false,
        merge: true,
    };
    pub const ALL: Cascade = Cascade {
        persist: true,
        remove: true,
        merge: true,
    };

    /// Union of two rule sets.
    pub const fn with(self, other: Cascade) -> Cascade {
        Cascade {
            persist: self.persist || other.persist,
            remove: self.remove || other.remove,
            merge: self.merge || other.merge,
        }
    }
}

/// Cardinality of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl RelationKind {
    /// Relation holds at most one entity.
    pub const fn is_to_one(self) -> bool {
        matches!(self, RelationKind::ManyToOne | RelationKind::OneToOne)
    }

    /// Relation holds a collection.
    pub const fn is_to_many(self) -> bool {
        !self.is_to_one()
    }
}

/// Link table backing an owning many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotTable {
    /// Link table name
    pub table: String,
    /// Columns referencing the owner's primary key
    pub owner_columns: Vec<String>,
    /// Columns referencing the target's primary key
    pub target_columns: Vec<String>,
}

/// A relation between two entity types.
#[derive(Debug, Clone)]
pub struct RelationMetadata {
    /// Relation name as used on the entity
    pub name: String,
    pub kind: RelationKind,
    /// Target entity name
    pub target: String,
    /// Owning side holds the foreign key or pivot
    pub owner: bool,
    /// Name of the owning relation on the target (inverse side only)
    pub mapped_by: Option<String>,
    /// Name of the inverse relation on the target (owning side only)
    pub inversed_by: Option<String>,
    /// Foreign-key columns on this table (owning to-one only)
    pub join_columns: Vec<String>,
    /// Link table (owning many-to-many only)
    pub pivot: Option<PivotTable>,
    /// Whether the foreign key accepts NULL
    pub nullable: bool,
    pub cascade: Cascade,
    /// Delete entities detached from this relation
    pub orphan_removal: bool,
}

impl RelationMetadata {
    fn new(name: impl Into<String>, kind: RelationKind, target: impl Into<String>, owner: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            owner,
            mapped_by: None,
            inversed_by: None,
            join_columns: Vec::new(),
            pivot: None,
            nullable: false,
            cascade: Cascade::NONE,
            orphan_removal: false,
        }
    }

    /// Owning many-to-one relation (holds the foreign key).
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::ManyToOne, target, true)
    }

    /// Owning one-to-one relation. Call [`mapped_by`](Self::mapped_by) for the inverse side.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::OneToOne, target, true)
    }

    /// Inverse one-to-many relation, mapped by a many-to-one on the target.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut rel = Self::new(name, RelationKind::OneToMany, target, false);
        rel.mapped_by = Some(mapped_by.into());
        rel
    }

    /// Owning many-to-many relation. Call [`mapped_by`](Self::mapped_by) for the inverse side.
    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, RelationKind::ManyToMany, target, true)
    }

    /// Make this the inverse side of `relation` on the target.
    pub fn mapped_by(mut self, relation: impl Into<String>) -> Self {
        self.mapped_by = Some(relation.into());
        self.owner = false;
        self
    }

    /// Name the inverse relation on the target.
    pub fn inversed_by(mut self, relation: impl Into<String>) -> Self {
        self.inversed_by = Some(relation.into());
        self
    }

    /// Override the foreign-key columns.
    pub fn join_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Override the link table.
    pub fn pivot(mut self, pivot: PivotTable) -> Self {
        self.pivot = Some(pivot);
        self
    }

    /// Allow a NULL foreign key.
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set cascade rules.
    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    /// Enable orphan removal.
    pub fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    /// Owning to-one: the foreign key lives on this entity's table.
    pub fn is_owning_to_one(&self) -> bool {
        self.owner && self.kind.is_to_one()
    }

    /// Owning many-to-many: membership lives in the pivot table.
    pub fn is_owning_many_to_many(&self) -> bool {
        self.owner && self.kind == RelationKind::ManyToMany
    }

    /// The name of the relation on the other side, if the relation is bidirectional.
    pub fn other_side(&self) -> Option<&str> {
        self.mapped_by.as_deref().or(self.inversed_by.as_deref())
    }
}

/// A lifecycle hook declared on an entity type.
///
/// The hook is stored type-erased: the session layer owns the hook trait and
/// downcasts registrations back when it dispatches an event.
#[derive(Clone)]
pub struct MetadataHook {
    /// Event name, e.g. `before_create`
    pub event: String,
    hook: Arc<dyn Any + Send + Sync>,
}

impl MetadataHook {
    pub fn new(event: impl Into<String>, hook: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            event: event.into(),
            hook,
        }
    }

    /// The registered hook, if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.hook.downcast_ref::<T>()
    }
}

impl fmt::Debug for MetadataHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataHook")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Describes one entity type.
///
/// Immutable once resolved and shared behind `Arc` by every session.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    /// Entity type name
    pub name: String,
    /// Table (or collection) name
    pub table: String,
    /// Root of the inheritance hierarchy (the entity itself when not inherited)
    pub root: String,
    /// Parent entity for single-table inheritance
    pub extends: Option<String>,
    /// Column holding the discriminator (shared by the whole hierarchy)
    pub discriminator_column: Option<String>,
    /// This entity's discriminator value
    pub discriminator_value: Option<Value>,
    pub properties: Vec<PropertyMetadata>,
    pub relations: Vec<RelationMetadata>,
    /// Primary-key property names, in key order
    pub primary_key: Vec<String>,
    /// Name of the version property, if any
    pub version_property: Option<String>,
    /// Hooks declared on this type, in registration order (not inherited;
    /// dispatch walks the ancestors)
    pub hooks: Vec<MetadataHook>,
}

impl EntityMetadata {
    /// Declare an entity type.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.to_lowercase(),
            root: name.clone(),
            name,
            extends: None,
            discriminator_column: None,
            discriminator_value: None,
            properties: Vec::new(),
            relations: Vec::new(),
            primary_key: Vec::new(),
            version_property: None,
            hooks: Vec::new(),
        }
    }

    /// Set the table name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Add a property.
    pub fn property(mut self, property: PropertyMetadata) -> Self {
        self.properties.push(property);
        self
    }

    /// Add a relation.
    pub fn relation(mut self, relation: RelationMetadata) -> Self {
        self.relations.push(relation);
        self
    }

    /// Inherit from `parent` using single-table inheritance.
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    /// Declare the discriminator column (on the hierarchy root).
    pub fn discriminator_column(mut self, column: impl Into<String>) -> Self {
        self.discriminator_column = Some(column.into());
        self
    }

    /// Set this entity's discriminator value.
    pub fn discriminator_value(mut self, value: impl Into<Value>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    /// Attach a lifecycle hook.
    pub fn with_hook(mut self, hook: MetadataHook) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Hooks declared on this type for `event`.
    pub fn hooks_for<'a>(&'a self, event: &'a str) -> impl Iterator<Item = &'a MetadataHook> + 'a {
        self.hooks.iter().filter(move |h| h.event == event)
    }

    /// Look up a property by name.
    pub fn get_property(&self, name: &str) -> Option<&PropertyMetadata> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Look up a relation by name.
    pub fn get_relation(&self, name: &str) -> Option<&RelationMetadata> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Primary-key properties in key order.
    pub fn primary_key_properties(&self) -> impl Iterator<Item = &PropertyMetadata> {
        self.primary_key
            .iter()
            .filter_map(|name| self.get_property(name))
    }

    /// Primary-key columns in key order.
    pub fn primary_key_columns(&self) -> Vec<String> {
        self.primary_key_properties()
            .map(|p| p.column.clone())
            .collect()
    }

    /// The version property, if the entity is versioned.
    pub fn version(&self) -> Option<&PropertyMetadata> {
        self.version_property
            .as_deref()
            .and_then(|name| self.get_property(name))
    }

    /// Whether the entity takes part in single-table inheritance.
    pub fn is_inherited(&self) -> bool {
        self.discriminator_column.is_some()
    }

    /// Owning to-one relations (those holding foreign-key columns).
    pub fn owning_to_one(&self) -> impl Iterator<Item = &RelationMetadata> {
        self.relations.iter().filter(|r| r.is_owning_to_one())
    }

    /// To-many relations.
    pub fn collections(&self) -> impl Iterator<Item = &RelationMetadata> {
        self.relations.iter().filter(|r| r.kind.is_to_many())
    }

    /// A property is part of the key when it is a primary-key column.
    pub fn is_primary_key(&self, property: &str) -> bool {
        self.primary_key.iter().any(|p| p == property)
    }
}

fn identifier_regex() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

#[allow(clippy::result_large_err)]
fn check_identifier(entity: &str, what: &str, ident: &str) -> Result<()> {
    if identifier_regex().is_some_and(|re| re.is_match(ident)) {
        Ok(())
    } else {
        Err(Error::metadata(
            MetadataErrorKind::InvalidIdentifier,
            entity,
            format!("invalid {} name '{}'", what, ident),
        ))
    }
}

/// Resolved metadata for every entity type, keyed by entity name.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: HashMap<String, Arc<EntityMetadata>>,
    order: Vec<String>,
}

impl MetadataRegistry {
    /// Start declaring entities.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up resolved metadata by entity name.
    pub fn get(&self, name: &str) -> Option<&Arc<EntityMetadata>> {
        self.entities.get(name)
    }

    /// Look up resolved metadata, failing with [`MetadataErrorKind::UnknownEntity`].
    #[allow(clippy::result_large_err)]
    pub fn require(&self, name: &str) -> Result<&Arc<EntityMetadata>> {
        self.entities.get(name).ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnknownEntity,
                name,
                "entity is not registered",
            )
        })
    }

    /// All entities in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.order.iter().filter_map(|name| self.entities.get(name))
    }

    /// Number of registered entity types.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no entity is registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Resolve the concrete type of a row from its discriminator value.
    ///
    /// Falls back to `meta` itself when the hierarchy has no discriminator or
    /// no member claims the value.
    pub fn concrete_type<'a>(
        &'a self,
        meta: &'a Arc<EntityMetadata>,
        discriminator: Option<&Value>,
    ) -> &'a Arc<EntityMetadata> {
        let Some(value) = discriminator else {
            return meta;
        };
        self.entities()
            .find(|candidate| {
                candidate.root == meta.root && candidate.discriminator_value.as_ref() == Some(value)
            })
            .unwrap_or(meta)
    }

    /// Discriminator values of `meta` and every entity inheriting from it.
    pub fn discriminator_values(&self, meta: &EntityMetadata) -> Vec<Value> {
        self.entities()
            .filter(|candidate| self.inherits_from(candidate, &meta.name))
            .filter_map(|candidate| candidate.discriminator_value.clone())
            .collect()
    }

    /// Whether `meta` is `ancestor` or inherits from it.
    pub fn inherits_from(&self, meta: &EntityMetadata, ancestor: &str) -> bool {
        let mut current = Some(meta);
        let mut hops = 0;
        while let Some(m) = current {
            if m.name == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.order.len() {
                return false;
            }
            current = m.extends.as_deref().and_then(|p| self.get(p)).map(Arc::as_ref);
        }
        false
    }
}

/// Collects unresolved entity declarations.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    declared: Vec<EntityMetadata>,
}

impl RegistryBuilder {
    /// Declare an entity.
    pub fn entity(mut self, entity: EntityMetadata) -> Self {
        self.declared.push(entity);
        self
    }

    /// Run the resolution pass.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<MetadataRegistry> {
        let mut by_name: HashMap<String, EntityMetadata> = HashMap::new();
        let mut order = Vec::with_capacity(self.declared.len());
        for entity in self.declared {
            check_identifier(&entity.name, "entity", &entity.name)?;
            if by_name.contains_key(&entity.name) {
                return Err(Error::metadata(
                    MetadataErrorKind::Duplicate,
                    &entity.name,
                    "entity declared twice",
                ));
            }
            order.push(entity.name.clone());
            by_name.insert(entity.name.clone(), entity);
        }

        let flattened = flatten_inheritance(&order, &by_name)?;
        let mut resolved: HashMap<String, EntityMetadata> = HashMap::new();
        for name in &order {
            let Some(mut entity) = flattened.get(name).cloned() else {
                continue;
            };
            resolve_keys(&mut entity)?;
            resolved.insert(name.clone(), entity);
        }

        let snapshot = resolved.clone();
        for name in &order {
            if let Some(entity) = resolved.get_mut(name) {
                resolve_relations(entity, &snapshot)?;
            }
        }

        tracing::debug!(entities = order.len(), "Resolved entity metadata");

        let entities = resolved
            .into_iter()
            .map(|(name, meta)| (name, Arc::new(meta)))
            .collect();
        Ok(MetadataRegistry { entities, order })
    }
}

/// Copy inherited tables, properties and relations down the hierarchy.
#[allow(clippy::result_large_err)]
fn flatten_inheritance(
    order: &[String],
    by_name: &HashMap<String, EntityMetadata>,
) -> Result<HashMap<String, EntityMetadata>> {
    let mut out = HashMap::new();
    for name in order {
        let Some(entity) = by_name.get(name) else {
            continue;
        };
        let mut chain = vec![entity];
        let mut seen = HashSet::new();
        seen.insert(entity.name.as_str());
        while let Some(parent) = chain.last().and_then(|e| e.extends.as_deref()) {
            let Some(parent_meta) = by_name.get(parent) else {
                return Err(Error::metadata(
                    MetadataErrorKind::Inheritance,
                    name,
                    format!("parent entity '{}' is not registered", parent),
                ));
            };
            if !seen.insert(parent_meta.name.as_str()) {
                return Err(Error::metadata(
                    MetadataErrorKind::Inheritance,
                    name,
                    "inheritance chain loops back on itself",
                ));
            }
            chain.push(parent_meta);
        }

        let mut flat = entity.clone();
        if let Some(root) = chain.last() {
            if root.name != entity.name {
                flat.root = root.name.clone();
                flat.table = root.table.clone();
                flat.discriminator_column = root.discriminator_column.clone();
                if flat.discriminator_column.is_none() {
                    return Err(Error::metadata(
                        MetadataErrorKind::Inheritance,
                        name,
                        format!("root entity '{}' declares no discriminator column", root.name),
                    ));
                }
                if flat.discriminator_value.is_none() {
                    return Err(Error::metadata(
                        MetadataErrorKind::Inheritance,
                        name,
                        "inherited entity declares no discriminator value",
                    ));
                }
                // Ancestors' members come first, root-most first.
                let mut properties = Vec::new();
                let mut relations = Vec::new();
                for ancestor in chain.iter().rev() {
                    for p in &ancestor.properties {
                        if !properties.iter().any(|q: &PropertyMetadata| q.name == p.name) {
                            properties.push(p.clone());
                        }
                    }
                    for r in &ancestor.relations {
                        if !relations.iter().any(|q: &RelationMetadata| q.name == r.name) {
                            relations.push(r.clone());
                        }
                    }
                }
                flat.properties = properties;
                flat.relations = relations;
            }
        }
        out.insert(name.clone(), flat);
    }
    Ok(out)
}

#[allow(clippy::result_large_err)]
fn resolve_keys(entity: &mut EntityMetadata) -> Result<()> {
    check_identifier(&entity.name, "table", &entity.table)?;
    if let Some(column) = &entity.discriminator_column {
        check_identifier(&entity.name, "column", column)?;
    }
    let mut seen = HashSet::new();
    for p in &entity.properties {
        check_identifier(&entity.name, "property", &p.name)?;
        check_identifier(&entity.name, "column", &p.column)?;
        if !seen.insert(p.name.as_str()) {
            return Err(Error::metadata(
                MetadataErrorKind::Duplicate,
                &entity.name,
                format!("property '{}' declared twice", p.name),
            ));
        }
    }
    for r in &entity.relations {
        check_identifier(&entity.name, "relation", &r.name)?;
        if !seen.insert(r.name.as_str()) {
            return Err(Error::metadata(
                MetadataErrorKind::Duplicate,
                &entity.name,
                format!("'{}' declared as both a property and a relation", r.name),
            ));
        }
    }

    entity.primary_key = entity
        .properties
        .iter()
        .filter(|p| p.primary_key)
        .map(|p| p.name.clone())
        .collect();
    if entity.primary_key.is_empty() {
        return Err(Error::metadata(
            MetadataErrorKind::MissingPrimaryKey,
            &entity.name,
            "entity declares no primary key",
        ));
    }

    let versions: Vec<_> = entity
        .properties
        .iter()
        .filter(|p| p.version)
        .map(|p| p.name.clone())
        .collect();
    if versions.len() > 1 {
        return Err(Error::metadata(
            MetadataErrorKind::Duplicate,
            &entity.name,
            format!("more than one version property: {}", versions.join(", ")),
        ));
    }
    entity.version_property = versions.into_iter().next();
    Ok(())
}

#[allow(clippy::result_large_err)]
fn resolve_relations(
    entity: &mut EntityMetadata,
    all: &HashMap<String, EntityMetadata>,
) -> Result<()> {
    let owner_name = entity.name.clone();
    let owner_table = entity.table.clone();
    let owner_pk = entity.primary_key_columns();

    for rel in &mut entity.relations {
        let Some(target) = all.get(&rel.target) else {
            return Err(Error::metadata(
                MetadataErrorKind::UnresolvedRelation,
                &owner_name,
                format!(
                    "relation '{}' targets unknown entity '{}'",
                    rel.name, rel.target
                ),
            ));
        };
        let target_pk = target.primary_key_columns();

        if let Some(mapped_by) = &rel.mapped_by {
            let Some(other) = target.get_relation(mapped_by) else {
                return Err(Error::metadata(
                    MetadataErrorKind::UnresolvedRelation,
                    &owner_name,
                    format!(
                        "relation '{}' is mapped by '{}.{}', which does not exist",
                        rel.name, rel.target, mapped_by
                    ),
                ));
            };
            if !other.owner {
                return Err(Error::metadata(
                    MetadataErrorKind::UnresolvedRelation,
                    &owner_name,
                    format!(
                        "relation '{}' is mapped by '{}.{}', which is not an owning side",
                        rel.name, rel.target, mapped_by
                    ),
                ));
            }
            rel.owner = false;
            continue;
        }

        match rel.kind {
            RelationKind::OneToMany => {
                return Err(Error::metadata(
                    MetadataErrorKind::UnresolvedRelation,
                    &owner_name,
                    format!("one-to-many relation '{}' needs mapped_by", rel.name),
                ));
            }
            RelationKind::ManyToOne | RelationKind::OneToOne => {
                if rel.join_columns.is_empty() {
                    rel.join_columns = target_pk
                        .iter()
                        .map(|pk| format!("{}_{}", rel.name, pk))
                        .collect();
                }
                if rel.join_columns.len() != target_pk.len() {
                    return Err(Error::metadata(
                        MetadataErrorKind::UnresolvedRelation,
                        &owner_name,
                        format!(
                            "relation '{}' has {} join columns but '{}' has a {}-column key",
                            rel.name,
                            rel.join_columns.len(),
                            rel.target,
                            target_pk.len()
                        ),
                    ));
                }
                for column in &rel.join_columns {
                    check_identifier(&owner_name, "column", column)?;
                }
            }
            RelationKind::ManyToMany => {
                if rel.pivot.is_none() {
                    let owner_columns: Vec<String> = owner_pk
                        .iter()
                        .map(|pk| format!("{}_{}", owner_table, pk))
                        .collect();
                    let mut target_columns: Vec<String> = target_pk
                        .iter()
                        .map(|pk| format!("{}_{}", target.table, pk))
                        .collect();
                    if target_columns.iter().any(|c| owner_columns.contains(c)) {
                        target_columns = target_pk
                            .iter()
                            .map(|pk| format!("{}_{}", rel.name, pk))
                            .collect();
                    }
                    rel.pivot = Some(PivotTable {
                        table: format!("{}_{}", owner_table, rel.name),
                        owner_columns,
                        target_columns,
                    });
                }
                if let Some(pivot) = &rel.pivot {
                    check_identifier(&owner_name, "table", &pivot.table)?;
                    if pivot.owner_columns.len() != owner_pk.len()
                        || pivot.target_columns.len() != target_pk.len()
                    {
                        return Err(Error::metadata(
                            MetadataErrorKind::UnresolvedRelation,
                            &owner_name,
                            format!(
                                "pivot table of '{}' does not match the key arity of its sides",
                                rel.name
                            ),
                        ));
                    }
                }
            }
        }

        if let Some(inversed_by) = &rel.inversed_by {
            let matches = target
                .get_relation(inversed_by)
                .is_some_and(|other| other.mapped_by.as_deref() == Some(rel.name.as_str()));
            if !matches {
                return Err(Error::metadata(
                    MetadataErrorKind::UnresolvedRelation,
                    &owner_name,
                    format!(
                        "relation '{}' is inversed by '{}.{}', which is not mapped back to it",
                        rel.name, rel.target, inversed_by
                    ),
                ));
            }
        }
    }
    Ok(())
}
