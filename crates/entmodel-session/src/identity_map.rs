//! Identity Map: one managed instance per (root entity type, primary key).
//!
//! The map guarantees that within a session every row corresponds to exactly
//! one [`Entity`]. Lookups for the same key return handles to the same
//! instance, so a change made through one handle is visible through all
//! of them.
//!
//! Keys use the *root* entity name, so an `Employee` inheriting from
//! `Person` (single-table inheritance) lives under the same key space as
//! every other `Person`.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let key = IdentityKey::new("Author", &PrimaryKey::single(1_i64));
//!
//! let managed = map.register(author.clone(), key.clone());
//! assert!(managed.ptr_eq(&author));
//!
//! // A second instance for the same key folds into the first.
//! let folded = map.register(duplicate, key.clone());
//! assert!(folded.ptr_eq(&author));
//! ```

use crate::entity::{Entity, EntityId};
use entmodel_core::{EntityMetadata, Error, IdentityConflictError, PrimaryKey, Result};
use std::collections::HashMap;
use std::fmt;

/// Identity-map key: root entity name plus serialized primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    root: String,
    key: String,
}

impl IdentityKey {
    /// Build a key for `root` and `pk`.
    pub fn new(root: impl Into<String>, pk: &PrimaryKey) -> Self {
        Self {
            root: root.into(),
            key: pk.serialize(),
        }
    }

    /// Key for an entity type's root.
    pub fn for_type(meta: &EntityMetadata, pk: &PrimaryKey) -> Self {
        Self::new(meta.root.clone(), pk)
    }

    /// Key of an entity, once its primary key is known.
    pub fn of(entity: &Entity) -> Option<Self> {
        entity
            .primary_key()
            .map(|pk| Self::for_type(entity.metadata(), &pk))
    }

    /// Root entity name.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Serialized primary key.
    pub fn serialized_key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root, self.key)
    }
}

/// Per-session mapping from identity key to the managed instance.
///
/// Iteration follows registration order so flushes are deterministic.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, Entity>,
    by_instance: HashMap<EntityId, IdentityKey>,
    order: Vec<IdentityKey>,
}

impl IdentityMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entity` under `key` and return the managed instance.
    ///
    /// Idempotent: when the key is already present the existing instance is
    /// returned and `entity` is discarded. Callers must continue with the
    /// returned handle.
    pub fn register(&mut self, entity: Entity, key: IdentityKey) -> Entity {
        if let Some(existing) = self.entries.get(&key) {
            tracing::trace!(key = %key, "Identity map hit on register");
            return existing.clone();
        }
        if let Some(old) = self.by_instance.insert(entity.id(), key.clone()) {
            // The instance was registered under a different key before.
            self.entries.remove(&old);
            self.order.retain(|k| k != &old);
        }
        self.order.push(key.clone());
        self.entries.insert(key, entity.clone());
        entity
    }

    /// Register `entity`, failing if a *different* instance already owns `key`.
    #[allow(clippy::result_large_err)]
    pub fn attach(&mut self, entity: &Entity, key: IdentityKey) -> Result<()> {
        if let Some(existing) = self.entries.get(&key) {
            if existing.ptr_eq(entity) {
                return Ok(());
            }
            return Err(Error::IdentityConflict(IdentityConflictError {
                entity: key.root.clone(),
                key: key.key.clone(),
            }));
        }
        self.register(entity.clone(), key);
        Ok(())
    }

    /// Look up the managed instance for `key`.
    pub fn get(&self, key: &IdentityKey) -> Option<&Entity> {
        self.entries.get(key)
    }

    /// Look up by entity type and primary key.
    pub fn find(&self, meta: &EntityMetadata, pk: &PrimaryKey) -> Option<&Entity> {
        self.get(&IdentityKey::for_type(meta, pk))
    }

    /// Whether `key` is mapped.
    pub fn contains_key(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether this exact instance is mapped.
    pub fn contains(&self, entity: &Entity) -> bool {
        self.by_instance.contains_key(&entity.id())
    }

    /// Key under which an instance is mapped.
    pub fn key_of(&self, entity: &Entity) -> Option<&IdentityKey> {
        self.by_instance.get(&entity.id())
    }

    /// Remove an entry, returning the instance that was mapped.
    pub fn remove(&mut self, key: &IdentityKey) -> Option<Entity> {
        let entity = self.entries.remove(key)?;
        self.by_instance.remove(&entity.id());
        self.order.retain(|k| k != key);
        Some(entity)
    }

    /// Remove an instance wherever it is mapped.
    pub fn remove_entity(&mut self, entity: &Entity) -> bool {
        match self.by_instance.get(&entity.id()).cloned() {
            Some(key) => self.remove(&key).is_some(),
            None => false,
        }
    }

    /// Keys rendered as `Root:serialized-key`, in registration order.
    pub fn keys(&self) -> impl Iterator<Item = String> + '_ {
        self.order.iter().map(ToString::to_string)
    }

    /// Managed instances in registration order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.order.iter().filter_map(|k| self.entries.get(k))
    }

    /// Number of managed instances.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is managed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every instance.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_instance.clear();
        self.order.clear();
    }
}
