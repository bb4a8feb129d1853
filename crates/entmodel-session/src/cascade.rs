//! Cascade resolution: which entities a flush touches.
//!
//! Starting from the entities the caller persisted or removed and from every
//! managed entity, the resolver walks relations flagged for cascade and
//! expands the working set:
//!
//! - new entities reachable through cascade-persist relations are created
//! - entities reachable from removed ones through cascade-remove are deleted
//! - items removed from an orphan-removal collection, and the previous
//!   target of an orphan-removal reference, are deleted
//!
//! Relations without the flag are never traversed. A new entity reached only
//! through such a relation is left out of the flush; its foreign key is
//! written as NULL unless strict cascade mode turns that into an error.

use crate::entity::{Entity, EntityId};
use crate::identity_map::{IdentityKey, IdentityMap};
use crate::snapshot::SnapshotStore;
use entmodel_core::{CascadeError, Error, MetadataRegistry, RelationKind, RelationMetadata, Result};
use std::collections::{HashSet, VecDeque};

/// Insertion-ordered set of entities keyed by instance.
#[derive(Debug, Default)]
struct OrderedSet {
    ids: HashSet<EntityId>,
    items: Vec<Entity>,
}

impl OrderedSet {
    fn insert(&mut self, entity: &Entity) -> bool {
        if !self.ids.insert(entity.id()) {
            return false;
        }
        self.items.push(entity.clone());
        true
    }

    fn contains(&self, entity: &Entity) -> bool {
        self.ids.contains(&entity.id())
    }
}

/// Entities one flush computes change sets for.
#[derive(Debug, Default)]
pub struct WorkingSet {
    /// New entities, in persist then discovery order
    pub creates: Vec<Entity>,
    /// Managed entities to diff
    pub updates: Vec<Entity>,
    /// Managed entities to delete
    pub deletes: Vec<Entity>,
    /// New entities that were neither persisted nor reached by cascade
    pub unpersisted: Vec<Entity>,
    /// Removed entities that were never flushed; they are dropped silently
    pub collapsed: Vec<Entity>,
}

impl WorkingSet {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Targets of `rel` a persist cascade follows: the loaded to-one target, or
/// initialized items plus pending additions.
fn persist_targets(entity: &Entity, rel: &RelationMetadata) -> Vec<Entity> {
    if rel.kind.is_to_one() {
        return entity.related(&rel.name).into_iter().collect();
    }
    let Some(collection) = entity.collection_state(&rel.name) else {
        return Vec::new();
    };
    let mut targets: Vec<Entity> = collection.items().map(<[Entity]>::to_vec).unwrap_or_default();
    for added in collection.added() {
        if !targets.iter().any(|t| t.ptr_eq(added)) {
            targets.push(added.clone());
        }
    }
    targets
}

/// Targets of `rel` already in memory (remove and merge cascades).
fn loaded_targets(entity: &Entity, rel: &RelationMetadata) -> Vec<Entity> {
    if rel.kind.is_to_one() {
        return entity.related(&rel.name).into_iter().collect();
    }
    entity.collection(&rel.name).unwrap_or_default()
}

/// Expands persist/remove roots into a [`WorkingSet`].
pub struct CascadeResolver<'a> {
    registry: &'a MetadataRegistry,
    identity: &'a IdentityMap,
    snapshots: &'a SnapshotStore,
    session_id: u64,
    strict: bool,
}

impl<'a> CascadeResolver<'a> {
    pub fn new(
        registry: &'a MetadataRegistry,
        identity: &'a IdentityMap,
        snapshots: &'a SnapshotStore,
        session_id: u64,
    ) -> Self {
        Self {
            registry,
            identity,
            snapshots,
            session_id,
            strict: false,
        }
    }

    /// Fail on un-cascaded new entities instead of skipping them.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn is_managed(&self, entity: &Entity) -> bool {
        self.snapshots.contains(entity)
    }

    /// Managed by some other session.
    fn is_foreign(&self, entity: &Entity) -> bool {
        let owner = entity.session_id();
        owner != 0 && owner != self.session_id
    }

    /// Expand the caller's persist and remove lists.
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(level = "trace", skip_all, fields(persisted = persisted.len(), removed = removed.len()))]
    pub fn expand(&self, persisted: &[Entity], removed: &[Entity]) -> Result<WorkingSet> {
        let mut removing = OrderedSet::default();
        for entity in removed {
            self.cascade_remove(entity, &mut removing);
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut creates = OrderedSet::default();
        let mut orphans = Vec::new();
        let mut candidates: Vec<(String, String, Entity)> = Vec::new();

        let managed = self.identity.entities().filter(|e| self.is_managed(e));
        for root in persisted.iter().chain(managed) {
            if removing.contains(root) || !visited.insert(root.id()) {
                continue;
            }
            if !self.is_managed(root) {
                creates.insert(root);
            }
            queue.push_back(root.clone());
        }

        while let Some(entity) = queue.pop_front() {
            let meta = entity.metadata();
            for rel in &meta.relations {
                if rel.orphan_removal {
                    self.collect_orphans(&entity, rel, &mut orphans);
                }
                for target in persist_targets(&entity, rel) {
                    if self.is_foreign(&target) {
                        tracing::trace!(target = ?target, "Skipping entity of another session");
                        continue;
                    }
                    if removing.contains(&target) {
                        continue;
                    }
                    if rel.cascade.persist {
                        if visited.insert(target.id()) {
                            if !self.is_managed(&target) {
                                tracing::trace!(
                                    from = ?entity,
                                    relation = %rel.name,
                                    target = ?target,
                                    "Cascading persist"
                                );
                                creates.insert(&target);
                            }
                            queue.push_back(target);
                        }
                    } else if !self.is_managed(&target) && target.primary_key().is_none() {
                        candidates.push((meta.name.clone(), rel.name.clone(), target));
                    }
                }
            }
        }

        for orphan in &orphans {
            tracing::trace!(orphan = ?orphan, "Scheduling orphan removal");
            self.cascade_remove(orphan, &mut removing);
        }

        let mut unpersisted = OrderedSet::default();
        for (entity, relation, target) in candidates {
            if creates.contains(&target) || removing.contains(&target) {
                continue;
            }
            if self.strict {
                return Err(Error::Cascade(CascadeError {
                    entity,
                    relation,
                    target: target.entity_type().to_string(),
                }));
            }
            if unpersisted.insert(&target) {
                tracing::warn!(
                    entity = %entity,
                    relation = %relation,
                    target = ?target,
                    "Related entity was neither persisted nor cascaded; it will not be flushed"
                );
            }
        }

        let (deletes, collapsed): (Vec<Entity>, Vec<Entity>) = removing
            .items
            .iter()
            .cloned()
            .partition(|e| self.is_managed(e));
        let working = WorkingSet {
            creates: creates
                .items
                .into_iter()
                .filter(|e| !removing.contains(e))
                .collect(),
            updates: self
                .identity
                .entities()
                .filter(|e| self.is_managed(e) && !removing.contains(e))
                .cloned()
                .collect(),
            deletes,
            unpersisted: unpersisted.items,
            collapsed,
        };
        tracing::trace!(
            creates = working.creates.len(),
            updates = working.updates.len(),
            deletes = working.deletes.len(),
            "Working set expanded"
        );
        Ok(working)
    }

    fn cascade_remove(&self, root: &Entity, out: &mut OrderedSet) {
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(entity) = queue.pop_front() {
            if self.is_foreign(&entity) || !out.insert(&entity) {
                continue;
            }
            for rel in entity.metadata().relations.iter().filter(|r| r.cascade.remove) {
                for target in loaded_targets(&entity, rel) {
                    tracing::trace!(from = ?entity, relation = %rel.name, target = ?target, "Cascading remove");
                    queue.push_back(target);
                }
            }
        }
    }

    fn collect_orphans(&self, entity: &Entity, rel: &RelationMetadata, out: &mut Vec<Entity>) {
        if rel.kind.is_to_many() {
            let Some(collection) = entity.collection_state(&rel.name) else {
                return;
            };
            for item in collection.removed() {
                if !self.is_managed(item) {
                    continue;
                }
                // Moved to another owner rather than orphaned.
                let reparented = rel.kind == RelationKind::OneToMany
                    && rel
                        .other_side()
                        .is_some_and(|side| matches!(item.reference(side), Some(Some(_))));
                if !reparented {
                    out.push(item.clone());
                }
            }
            return;
        }

        let Some(snapshot) = self.snapshots.get(entity) else {
            return;
        };
        let Some(Some(previous)) = snapshot.reference(&rel.name) else {
            return;
        };
        if let Some(Some(current)) = entity.reference(&rel.name) {
            if previous.matches(&current) {
                return;
            }
        }
        let (Some(key), Some(target_meta)) = (&previous.key, self.registry.get(&rel.target)) else {
            return;
        };
        if let Some(target) = self.identity.get(&IdentityKey::for_type(target_meta, key)) {
            out.push(target.clone());
        }
    }
}

/// Every entity reachable from `root` through cascade-merge relations,
/// `root` first.
pub fn merge_graph(root: &Entity) -> Vec<Entity> {
    let mut seen = OrderedSet::default();
    let mut queue = VecDeque::from([root.clone()]);
    while let Some(entity) = queue.pop_front() {
        if !seen.insert(&entity) {
            continue;
        }
        for rel in entity.metadata().relations.iter().filter(|r| r.cascade.merge) {
            queue.extend(loaded_targets(&entity, rel));
        }
    }
    seen.items
}
