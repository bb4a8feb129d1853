//! Snapshot store: the last state known to be persisted, per entity.
//!
//! A snapshot is captured after every successful load, flush and refresh
//! of an entity, and never at any other time. Diffing an entity against its
//! snapshot yields the field-level deltas a change set is built from.

use crate::entity::{Entity, EntityId, Reference};
use entmodel_core::{PrimaryKey, Value};
use std::collections::HashMap;
use std::time::Instant;

/// Captured target of an owning to-one relation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSnapshot {
    /// Target key at capture time
    pub key: Option<PrimaryKey>,
    /// Target instance at capture time, if it was loaded
    pub entity: Option<EntityId>,
}

impl ReferenceSnapshot {
    fn of(reference: &Reference) -> Self {
        match reference {
            Reference::Unloaded(key) => Self {
                key: Some(key.clone()),
                entity: None,
            },
            Reference::Loaded(target) => Self {
                key: target.primary_key(),
                entity: Some(target.id()),
            },
        }
    }

    /// Whether `reference` points at the same target.
    pub fn matches(&self, reference: &Reference) -> bool {
        if let (Some(id), Reference::Loaded(target)) = (self.entity, reference) {
            if id == target.id() {
                return true;
            }
        }
        match (&self.key, reference.key()) {
            (Some(a), Some(b)) => a.serialize() == b.serialize(),
            _ => false,
        }
    }
}

/// Last persisted state of one entity.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    values: HashMap<String, Value>,
    references: HashMap<String, Option<ReferenceSnapshot>>,
    taken_at: Instant,
}

impl EntitySnapshot {
    /// Snapshot value of a scalar property.
    pub fn value(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    /// Snapshot target of an owning to-one relation.
    ///
    /// `None` when the relation was not loaded at capture time,
    /// `Some(None)` when it was an explicit NULL.
    pub fn reference(&self, relation: &str) -> Option<Option<&ReferenceSnapshot>> {
        self.references.get(relation).map(Option::as_ref)
    }

    /// When the snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// What kind of member a [`FieldChange`] concerns.
#[derive(Debug, Clone)]
pub enum ChangeKind {
    /// Scalar property
    Scalar,
    /// Owning to-one relation; `target` is the new target, if loaded
    Reference { target: Option<Entity> },
}

/// One field-level delta.
#[derive(Debug, Clone)]
pub struct FieldChange {
    /// Property or relation name
    pub property: String,
    /// Snapshot value; `None` when nothing was captured for this field
    pub previous: Option<Value>,
    /// Current value. For references this is the target key, or NULL when
    /// the target has no key yet.
    pub current: Value,
    pub kind: ChangeKind,
}

impl FieldChange {
    /// Whether this delta re-points a relation.
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, ChangeKind::Reference { .. })
    }
}

/// Render a key as a single value (arrays for composite keys).
pub(crate) fn key_value(key: Option<&PrimaryKey>) -> Value {
    match key {
        None => Value::Null,
        Some(key) => match key.values() {
            [single] => single.clone(),
            many => Value::Array(many.to_vec()),
        },
    }
}

/// Per-session store of entity snapshots keyed by instance.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: HashMap<EntityId, EntitySnapshot>,
}

impl SnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current state of `entity` as its new baseline.
    #[tracing::instrument(level = "trace", skip(self, entity), fields(entity = ?entity))]
    pub fn capture(&mut self, entity: &Entity) -> &EntitySnapshot {
        let snapshot = {
            let data = entity.read();
            let references = entity
                .metadata()
                .owning_to_one()
                .filter_map(|rel| {
                    data.references.get(&rel.name).map(|r| {
                        (
                            rel.name.clone(),
                            r.as_ref().map(ReferenceSnapshot::of),
                        )
                    })
                })
                .collect();
            EntitySnapshot {
                values: data.values.clone(),
                references,
                taken_at: Instant::now(),
            }
        };
        tracing::trace!(fields = snapshot.values.len(), "Captured snapshot");
        self.snapshots.insert(entity.id(), snapshot);
        // Just inserted.
        &self.snapshots[&entity.id()]
    }

    /// Record a lazily loaded value in an existing baseline.
    pub(crate) fn record(&mut self, entity: &Entity, property: &str, value: Value) {
        if let Some(snapshot) = self.snapshots.get_mut(&entity.id()) {
            snapshot.values.insert(property.to_string(), value);
        }
    }

    /// Snapshot of an entity, if one was captured.
    pub fn get(&self, entity: &Entity) -> Option<&EntitySnapshot> {
        self.snapshots.get(&entity.id())
    }

    /// Whether an entity has a baseline.
    pub fn contains(&self, entity: &Entity) -> bool {
        self.snapshots.contains_key(&entity.id())
    }

    /// Drop an entity's baseline.
    pub fn remove(&mut self, entity: &Entity) -> Option<EntitySnapshot> {
        self.snapshots.remove(&entity.id())
    }

    /// Number of captured snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// True when nothing is captured.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Drop every baseline.
    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    /// Field-level deltas of `entity` against its baseline.
    ///
    /// Without a baseline, every set property and every non-null owning
    /// reference is a delta. With one, a property is a delta exactly when its
    /// comparator says the snapshot and current values differ. Properties
    /// with no value in memory (lazy properties never loaded) are skipped.
    pub fn diff(&self, entity: &Entity) -> Vec<FieldChange> {
        diff_against(entity, self.get(entity))
    }
}

/// Diff `entity` against an optional baseline.
pub(crate) fn diff_against(entity: &Entity, snapshot: Option<&EntitySnapshot>) -> Vec<FieldChange> {
    let meta = entity.metadata();
    let data = entity.read();
    let mut changes = Vec::new();

    for prop in &meta.properties {
        let Some(current) = data.values.get(&prop.name) else {
            continue;
        };
        let previous = snapshot.and_then(|s| s.values.get(&prop.name));
        let changed = match previous {
            None => true,
            Some(previous) => !prop.values_equal(previous, current),
        };
        if changed {
            changes.push(FieldChange {
                property: prop.name.clone(),
                previous: previous.cloned(),
                current: current.clone(),
                kind: ChangeKind::Scalar,
            });
        }
    }

    for rel in meta.owning_to_one() {
        let Some(current) = data.references.get(&rel.name) else {
            continue;
        };
        let previous = snapshot.and_then(|s| s.references.get(&rel.name));
        let changed = match (previous, current) {
            // Never captured: only a real target is a delta.
            (None, current) => current.is_some(),
            (Some(None), None) => false,
            (Some(Some(prev)), Some(cur)) => !prev.matches(cur),
            _ => true,
        };
        if changed {
            changes.push(FieldChange {
                property: rel.name.clone(),
                previous: previous.map(|p| key_value(p.as_ref().and_then(|p| p.key.as_ref()))),
                current: key_value(current.as_ref().and_then(Reference::key).as_ref()),
                kind: ChangeKind::Reference {
                    target: current.as_ref().and_then(|r| r.entity().cloned()),
                },
            });
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use entmodel_core::{
        CustomType, EntityMetadata, MetadataRegistry, PropertyMetadata, PropertyType,
        RelationMetadata,
    };
    use std::sync::Arc;

    /// Compares case-insensitively, the way a CITEXT column would.
    #[derive(Debug)]
    struct CaseInsensitive;

    impl CustomType for CaseInsensitive {
        fn name(&self) -> &str {
            "citext"
        }

        fn compare(&self, a: &Value, b: &Value) -> bool {
            match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
                _ => a == b,
            }
        }
    }

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .entity(
                EntityMetadata::new("User")
                    .property(PropertyMetadata::new("id", PropertyType::BigInt).primary_key(true))
                    .property(
                        PropertyMetadata::new("email", PropertyType::Text)
                            .custom_type(Arc::new(CaseInsensitive)),
                    )
                    .property(PropertyMetadata::new("balance", PropertyType::Decimal))
                    .property(PropertyMetadata::new("bio", PropertyType::Text).lazy(true))
                    .relation(RelationMetadata::many_to_one("manager", "User").nullable(true)),
            )
            .build()
            .unwrap()
    }

    fn user(reg: &MetadataRegistry) -> Entity {
        Entity::new(reg.get("User").unwrap())
            .with("id", 1_i64)
            .unwrap()
            .with("email", "a@example.com")
            .unwrap()
            .with("balance", Value::Decimal("10.50".into()))
            .unwrap()
    }

    #[test]
    fn never_captured_means_full_payload() {
        let reg = registry();
        let store = SnapshotStore::new();
        let u = user(&reg);
        let changes = store.diff(&u);
        let names: Vec<_> = changes.iter().map(|c| c.property.as_str()).collect();
        assert_eq!(names, vec!["id", "email", "balance"]);
        assert!(changes.iter().all(|c| c.previous.is_none()));
    }

    #[test]
    fn diff_uses_pluggable_comparators() {
        let reg = registry();
        let mut store = SnapshotStore::new();
        let u = user(&reg);
        store.capture(&u);

        u.set("email", "A@EXAMPLE.COM").unwrap();
        u.set("balance", Value::Decimal("10.5".into())).unwrap();
        assert!(store.diff(&u).is_empty());

        u.set("balance", Value::Decimal("11".into())).unwrap();
        let changes = store.diff(&u);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].property, "balance");
        assert_eq!(changes[0].previous, Some(Value::Decimal("10.50".into())));
    }

    #[test]
    fn unloaded_lazy_properties_are_not_deltas() {
        let reg = registry();
        let mut store = SnapshotStore::new();
        let u = user(&reg);
        store.capture(&u);
        assert!(!u.is_set("bio"));
        assert!(store.diff(&u).is_empty());

        // Loaded later and then set: reported with no previous value.
        u.set("bio", "hello").unwrap();
        let changes = store.diff(&u);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].previous.is_none());
    }

    #[test]
    fn references_compare_by_target_identity() {
        let reg = registry();
        let mut store = SnapshotStore::new();
        let boss = user(&reg);
        let other = Entity::new(reg.get("User").unwrap()).with("id", 2_i64).unwrap();
        let u = Entity::new(reg.get("User").unwrap()).with("id", 3_i64).unwrap();
        u.set_reference("manager", Some(&boss)).unwrap();
        store.capture(&u);
        assert!(store.diff(&u).is_empty());

        // Same key, unloaded form: still equal.
        u.set_reference_raw("manager", Some(Reference::Unloaded(PrimaryKey::single(1_i64))));
        assert!(store.diff(&u).is_empty());

        u.set_reference("manager", Some(&other)).unwrap();
        let changes = store.diff(&u);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_reference());
        assert_eq!(changes[0].previous, Some(Value::BigInt(1)));
        assert_eq!(changes[0].current, Value::BigInt(2));
    }

    #[test]
    fn capture_replaces_baseline() {
        let reg = registry();
        let mut store = SnapshotStore::new();
        let u = user(&reg);
        store.capture(&u);
        u.set("balance", Value::Decimal("1".into())).unwrap();
        assert_eq!(store.diff(&u).len(), 1);
        store.capture(&u);
        assert!(store.diff(&u).is_empty());
        assert_eq!(store.len(), 1);
        store.remove(&u);
        assert!(!store.contains(&u));
    }
}
