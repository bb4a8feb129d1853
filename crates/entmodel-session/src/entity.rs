//! Live entity instances, references and lazy collections.
//!
//! An [`Entity`] is a cheap, clonable handle to one in-memory instance.
//! Two handles are the same entity exactly when [`Entity::ptr_eq`] holds;
//! the identity map relies on that to guarantee one instance per key.
//!
//! To-one relations hold a [`Reference`]: either just the target's key
//! (`Unloaded`) or the target instance itself (`Loaded`). To-many relations
//! hold a [`Collection`] with an explicit load state and add/remove deltas
//! that are tracked even while the collection is uninitialized.
//!
//! Mutating one side of a bidirectional relation updates the other side, so
//! the owning side (the one that produces statements) always observes the
//! change regardless of which side the caller touched.

use entmodel_core::{
    Error, EntityMetadata, MetadataErrorKind, PrimaryKey, RelationKind, RelationMetadata, Result,
    Value,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one in-memory instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    fn next() -> Self {
        Self(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a to-one relation.
#[derive(Debug, Clone)]
pub enum Reference {
    /// Only the target's primary key is known.
    Unloaded(PrimaryKey),
    /// The target instance is in memory.
    Loaded(Entity),
}

impl Reference {
    /// The target's primary key, if known.
    pub fn key(&self) -> Option<PrimaryKey> {
        match self {
            Reference::Unloaded(key) => Some(key.clone()),
            Reference::Loaded(entity) => entity.primary_key(),
        }
    }

    /// The target instance, if loaded.
    pub fn entity(&self) -> Option<&Entity> {
        match self {
            Reference::Unloaded(_) => None,
            Reference::Loaded(entity) => Some(entity),
        }
    }

    /// Whether the target instance is in memory.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Reference::Loaded(_))
    }
}

/// Load state of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    Uninitialized,
    Loading,
    Initialized,
}

#[derive(Debug, Clone, Default)]
enum CollectionState {
    #[default]
    Uninitialized,
    Loading,
    Initialized(Vec<Entity>),
}

/// A to-many relation.
///
/// `added` and `removed` record membership changes since the last flush.
/// They are independent of the load state, so adding to a collection that
/// was never loaded does not require loading it.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    state: CollectionState,
    added: Vec<Entity>,
    removed: Vec<Entity>,
}

fn position(list: &[Entity], entity: &Entity) -> Option<usize> {
    list.iter().position(|e| e.ptr_eq(entity))
}

impl Collection {
    /// An initialized, empty collection (the state of a new entity).
    pub fn empty() -> Self {
        Self {
            state: CollectionState::Initialized(Vec::new()),
            ..Self::default()
        }
    }

    /// Current load state.
    pub fn status(&self) -> CollectionStatus {
        match self.state {
            CollectionState::Uninitialized => CollectionStatus::Uninitialized,
            CollectionState::Loading => CollectionStatus::Loading,
            CollectionState::Initialized(_) => CollectionStatus::Initialized,
        }
    }

    /// Whether the items are in memory.
    pub fn is_initialized(&self) -> bool {
        matches!(self.state, CollectionState::Initialized(_))
    }

    /// Items, if the collection is initialized.
    pub fn items(&self) -> Option<&[Entity]> {
        match &self.state {
            CollectionState::Initialized(items) => Some(items),
            _ => None,
        }
    }

    /// Items added since the last flush.
    pub fn added(&self) -> &[Entity] {
        &self.added
    }

    /// Items removed since the last flush.
    pub fn removed(&self) -> &[Entity] {
        &self.removed
    }

    /// Whether membership changed since the last flush.
    pub fn is_dirty(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Add an item, returning false if it was already a member.
    pub fn add(&mut self, entity: &Entity) -> bool {
        if let CollectionState::Initialized(items) = &self.state {
            if position(items, entity).is_some() {
                return false;
            }
        }
        if let Some(i) = position(&self.removed, entity) {
            self.removed.remove(i);
        } else if position(&self.added, entity).is_none() {
            self.added.push(entity.clone());
        } else {
            return false;
        }
        if let CollectionState::Initialized(items) = &mut self.state {
            items.push(entity.clone());
        }
        true
    }

    /// Remove an item, returning false if nothing changed.
    pub fn remove(&mut self, entity: &Entity) -> bool {
        let was_added = position(&self.added, entity);
        let member = match &mut self.state {
            CollectionState::Initialized(items) => match position(items, entity) {
                Some(i) => {
                    items.remove(i);
                    true
                }
                None => false,
            },
            // Membership is unknown until loaded; record the removal.
            _ => true,
        };
        if let Some(i) = was_added {
            self.added.remove(i);
            return true;
        }
        if !member || position(&self.removed, entity).is_some() {
            return false;
        }
        self.removed.push(entity.clone());
        true
    }

    /// Mark the collection as loading.
    pub(crate) fn begin_load(&mut self) {
        if !self.is_initialized() {
            self.state = CollectionState::Loading;
        }
    }

    /// Abandon a load that failed.
    pub(crate) fn abort_load(&mut self) {
        if matches!(self.state, CollectionState::Loading) {
            self.state = CollectionState::Uninitialized;
        }
    }

    /// Install loaded items, folding in pending deltas.
    pub(crate) fn finish_load(&mut self, loaded: Vec<Entity>) {
        let mut items: Vec<Entity> = loaded
            .into_iter()
            .filter(|e| position(&self.removed, e).is_none())
            .collect();
        for added in &self.added {
            if position(&items, added).is_none() {
                items.push(added.clone());
            }
        }
        self.state = CollectionState::Initialized(items);
    }

    /// Forget deltas after they have been persisted.
    pub(crate) fn clear_deltas(&mut self) {
        self.added.clear();
        self.removed.clear();
    }

    /// Add or drop an item without recording a delta (inverse-side mirroring).
    fn mirror(&mut self, entity: &Entity, present: bool) {
        if let CollectionState::Initialized(items) = &mut self.state {
            match (present, position(items, entity)) {
                (true, None) => items.push(entity.clone()),
                (false, Some(i)) => {
                    items.remove(i);
                }
                _ => {}
            }
        }
    }
}

/// Mutable state of an entity.
#[derive(Debug, Default)]
pub(crate) struct EntityData {
    /// Scalar values; absent means never set or never loaded.
    pub(crate) values: HashMap<String, Value>,
    /// To-one relations; `None` is an explicit null.
    pub(crate) references: HashMap<String, Option<Reference>>,
    pub(crate) collections: HashMap<String, Collection>,
}

struct EntityInner {
    id: EntityId,
    meta: Arc<EntityMetadata>,
    data: RwLock<EntityData>,
    session: AtomicU64,
}

/// Handle to one live entity instance.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.inner.meta.name, self.inner.id)?;
        if let Some(key) = self.primary_key() {
            write!(f, "({})", key)?;
        }
        Ok(())
    }
}

impl Entity {
    /// Create a new, unmanaged instance. To-many relations start initialized and empty.
    pub fn new(meta: &Arc<EntityMetadata>) -> Self {
        let collections = meta
            .collections()
            .map(|r| (r.name.clone(), Collection::empty()))
            .collect();
        Self::with_data(
            meta,
            EntityData {
                collections,
                ..EntityData::default()
            },
        )
    }

    /// Create an instance for hydration: collections start uninitialized.
    pub(crate) fn hydrated(meta: &Arc<EntityMetadata>) -> Self {
        let collections = meta
            .collections()
            .map(|r| (r.name.clone(), Collection::default()))
            .collect();
        Self::with_data(
            meta,
            EntityData {
                collections,
                ..EntityData::default()
            },
        )
    }

    fn with_data(meta: &Arc<EntityMetadata>, data: EntityData) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                id: EntityId::next(),
                meta: Arc::clone(meta),
                data: RwLock::new(data),
                session: AtomicU64::new(0),
            }),
        }
    }

    /// Builder-style [`set`](Self::set).
    #[allow(clippy::result_large_err)]
    pub fn with(self, property: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(property, value)?;
        Ok(self)
    }

    /// Process-unique instance id.
    pub fn id(&self) -> EntityId {
        self.inner.id
    }

    /// Resolved metadata of this instance's concrete type.
    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.inner.meta
    }

    /// Concrete entity type name.
    pub fn entity_type(&self) -> &str {
        &self.inner.meta.name
    }

    /// Whether two handles point at the same instance.
    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, EntityData> {
        self.inner.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, EntityData> {
        self.inner.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.inner.session.load(Ordering::Acquire)
    }

    pub(crate) fn bind_session(&self, session: u64) {
        self.inner.session.store(session, Ordering::Release);
    }

    /// Current value of a scalar property, if set or loaded.
    pub fn get(&self, property: &str) -> Option<Value> {
        self.read().values.get(property).cloned()
    }

    /// Whether a scalar property has a value in memory.
    pub fn is_set(&self, property: &str) -> bool {
        self.read().values.contains_key(property)
    }

    /// Set a scalar property.
    #[allow(clippy::result_large_err)]
    pub fn set(&self, property: &str, value: impl Into<Value>) -> Result<()> {
        if self.inner.meta.get_property(property).is_none() {
            return Err(self.unknown(property, "property"));
        }
        self.write().values.insert(property.to_string(), value.into());
        Ok(())
    }

    /// Primary key, once every key property holds a non-NULL value.
    pub fn primary_key(&self) -> Option<PrimaryKey> {
        let data = self.read();
        let values: Option<Vec<Value>> = self
            .inner
            .meta
            .primary_key
            .iter()
            .map(|name| data.values.get(name).filter(|v| !v.is_null()).cloned())
            .collect();
        values.map(PrimaryKey::new)
    }

    /// State of a to-one relation. `None` when never set or loaded.
    pub fn reference(&self, relation: &str) -> Option<Option<Reference>> {
        self.read().references.get(relation).cloned()
    }

    /// Loaded target of a to-one relation.
    pub fn related(&self, relation: &str) -> Option<Entity> {
        self.read()
            .references
            .get(relation)
            .and_then(|r| r.as_ref())
            .and_then(|r| r.entity().cloned())
    }

    /// Point a to-one relation at `target` (or at nothing).
    ///
    /// The inverse side, if declared, is updated in memory: an inverse
    /// collection on the old and new targets gains or loses this entity if it
    /// is initialized, and an inverse one-to-one is re-pointed.
    #[allow(clippy::result_large_err)]
    pub fn set_reference(&self, relation: &str, target: Option<&Entity>) -> Result<()> {
        let rel = self.to_one(relation)?.clone();
        let previous = {
            let mut data = self.write();
            data.references.insert(
                relation.to_string(),
                target.map(|t| Reference::Loaded(t.clone())),
            )
        };
        let previous = previous.flatten().and_then(|r| r.entity().cloned());
        if let Some(inverse) = rel.other_side() {
            if let Some(old) = previous.filter(|old| target.is_none_or(|t| !t.ptr_eq(old))) {
                old.mirror_inverse(inverse, self, false);
            }
            if let Some(new) = target {
                new.mirror_inverse(inverse, self, true);
            }
        }
        Ok(())
    }

    /// Set a to-one relation from a row's foreign-key value.
    pub(crate) fn set_reference_raw(&self, relation: &str, reference: Option<Reference>) {
        self.write()
            .references
            .insert(relation.to_string(), reference);
    }

    /// Loaded items of a to-many relation, if initialized.
    pub fn collection(&self, relation: &str) -> Option<Vec<Entity>> {
        self.read()
            .collections
            .get(relation)
            .and_then(|c| c.items().map(<[Entity]>::to_vec))
    }

    /// Load state of a to-many relation.
    pub fn collection_status(&self, relation: &str) -> Option<CollectionStatus> {
        self.read().collections.get(relation).map(Collection::status)
    }

    /// Snapshot of a collection, deltas included.
    pub fn collection_state(&self, relation: &str) -> Option<Collection> {
        self.read().collections.get(relation).cloned()
    }

    /// Add `item` to a to-many relation.
    #[allow(clippy::result_large_err)]
    pub fn add(&self, relation: &str, item: &Entity) -> Result<()> {
        let rel = self.to_many(relation)?.clone();
        let changed = {
            let mut data = self.write();
            data.collections
                .entry(relation.to_string())
                .or_default()
                .add(item)
        };
        if changed {
            self.propagate_membership(&rel, item, true);
        }
        Ok(())
    }

    /// Remove `item` from a to-many relation.
    #[allow(clippy::result_large_err)]
    pub fn remove_item(&self, relation: &str, item: &Entity) -> Result<()> {
        let rel = self.to_many(relation)?.clone();
        let changed = {
            let mut data = self.write();
            data.collections
                .entry(relation.to_string())
                .or_default()
                .remove(item)
        };
        if changed {
            self.propagate_membership(&rel, item, false);
        }
        Ok(())
    }

    /// Forget every collection delta once it has been flushed.
    pub(crate) fn clear_collection_deltas(&self) {
        for collection in self.write().collections.values_mut() {
            collection.clear_deltas();
        }
    }

    fn propagate_membership(&self, rel: &RelationMetadata, item: &Entity, present: bool) {
        let Some(other) = rel.other_side() else {
            return;
        };
        match rel.kind {
            RelationKind::OneToMany => {
                // The item's many-to-one is the owning side.
                let current = item.related(other);
                let points_here = current.as_ref().is_some_and(|c| c.ptr_eq(self));
                if present && !points_here {
                    if let Some(previous) = current {
                        previous.mirror_inverse(&rel.name, item, false);
                    }
                    item.set_reference_raw(other, Some(Reference::Loaded(self.clone())));
                } else if !present && points_here {
                    item.set_reference_raw(other, None);
                }
            }
            RelationKind::ManyToMany if rel.owner => {
                item.mirror_inverse(other, self, present);
            }
            RelationKind::ManyToMany => {
                // Inverse side: only the owner's delta produces pivot rows.
                let mut data = item.write();
                let collection = data.collections.entry(other.to_string()).or_default();
                if present {
                    collection.add(self);
                } else {
                    collection.remove(self);
                }
            }
            _ => {}
        }
    }

    /// Mirror a change made on the owning side into this entity's inverse relation.
    fn mirror_inverse(&self, relation: &str, other: &Entity, present: bool) {
        let Some(rel) = self.inner.meta.get_relation(relation) else {
            return;
        };
        let mut data = self.write();
        if rel.kind.is_to_many() {
            if let Some(collection) = data.collections.get_mut(relation) {
                collection.mirror(other, present);
            }
        } else if present {
            data.references.insert(
                relation.to_string(),
                Some(Reference::Loaded(other.clone())),
            );
        } else if data
            .references
            .get(relation)
            .and_then(|r| r.as_ref())
            .and_then(Reference::entity)
            .is_some_and(|e| e.ptr_eq(other))
        {
            data.references.insert(relation.to_string(), None);
        }
    }

    #[allow(clippy::result_large_err)]
    fn to_one(&self, relation: &str) -> Result<&RelationMetadata> {
        match self.inner.meta.get_relation(relation) {
            Some(rel) if rel.kind.is_to_one() => Ok(rel),
            _ => Err(self.unknown(relation, "to-one relation")),
        }
    }

    #[allow(clippy::result_large_err)]
    fn to_many(&self, relation: &str) -> Result<&RelationMetadata> {
        match self.inner.meta.get_relation(relation) {
            Some(rel) if rel.kind.is_to_many() => Ok(rel),
            _ => Err(self.unknown(relation, "to-many relation")),
        }
    }

    fn unknown(&self, name: &str, what: &str) -> Error {
        Error::metadata(
            MetadataErrorKind::UnknownProperty,
            &self.inner.meta.name,
            format!("no {} named '{}'", what, name),
        )
    }
}

/// Lifecycle state of an entity relative to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Persisted in this session but not yet flushed
    New,
    /// Flushed or loaded, tracked by the identity map
    Managed,
    /// Scheduled for deletion on the next flush
    Removed,
    /// Not tracked by this session
    Detached,
}
