//! Change-set computation.
//!
//! A [`ChangeSet`] is the per-entity record of one flush: whether the row is
//! created, updated or deleted, which fields changed, which owning
//! many-to-many memberships changed, and the optimistic-lock predicate the
//! statement must carry. Change sets are rebuilt from scratch on every flush
//! by diffing entities against their snapshots.

use crate::entity::Entity;
use crate::snapshot::{ChangeKind, EntitySnapshot, FieldChange, diff_against};
use entmodel_core::{
    EntityErrorKind, EntityMetadata, Error, PrimaryKey, PropertyMetadata, PropertyType, Result,
    Value, VersionCheck,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// What a change set does to its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSetKind {
    Create,
    Update,
    Delete,
}

impl ChangeSetKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ChangeSetKind::Create => "create",
            ChangeSetKind::Update => "update",
            ChangeSetKind::Delete => "delete",
        }
    }
}

/// Membership delta of one owning many-to-many relation.
#[derive(Debug, Clone)]
pub struct CollectionChange {
    pub relation: String,
    pub added: Vec<Entity>,
    pub removed: Vec<Entity>,
}

/// Per-entity record of one flush.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub entity: Entity,
    pub kind: ChangeSetKind,
    /// Field deltas in declaration order (properties first, then references)
    pub changes: Vec<FieldChange>,
    /// Owning many-to-many deltas, turned into pivot statements
    pub collection_changes: Vec<CollectionChange>,
    /// Predicate for updates and deletes of versioned entities
    pub version: Option<VersionCheck>,
    /// Key the row is addressed by (snapshot key for updates and deletes)
    pub key: Option<PrimaryKey>,
}

impl ChangeSet {
    /// Concrete entity type name.
    pub fn entity_type(&self) -> &str {
        self.entity.entity_type()
    }

    /// Delta for one property or relation.
    pub fn change(&self, property: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|c| c.property == property)
    }

    /// Whether the change set carries field deltas.
    pub fn has_field_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn is_create(&self) -> bool {
        self.kind == ChangeSetKind::Create
    }

    pub fn is_update(&self) -> bool {
        self.kind == ChangeSetKind::Update
    }

    pub fn is_delete(&self) -> bool {
        self.kind == ChangeSetKind::Delete
    }

    /// Entities this change set points at through owning references.
    pub(crate) fn referenced(&self) -> impl Iterator<Item = (&str, &Entity)> {
        self.changes.iter().filter_map(|c| match &c.kind {
            ChangeKind::Reference {
                target: Some(target),
            } => Some((c.property.as_str(), target)),
            _ => None,
        })
    }
}

/// Primary key as captured in a snapshot.
pub(crate) fn snapshot_key(meta: &EntityMetadata, snapshot: &EntitySnapshot) -> Option<PrimaryKey> {
    let values: Option<Vec<Value>> = meta
        .primary_key
        .iter()
        .map(|name| snapshot.value(name).filter(|v| !v.is_null()).cloned())
        .collect();
    values.map(PrimaryKey::new)
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Version a row starts at when inserted without one.
pub(crate) fn initial_version(prop: &PropertyMetadata) -> Value {
    match prop.property_type {
        PropertyType::Timestamp => Value::Timestamp(now_micros()),
        PropertyType::Integer => Value::Int(1),
        _ => Value::BigInt(1),
    }
}

/// Next version after `current`: integers increment, timestamps move to now.
pub(crate) fn next_version(prop: &PropertyMetadata, current: &Value) -> Value {
    match current {
        Value::TinyInt(n) => Value::TinyInt(n.wrapping_add(1)),
        Value::SmallInt(n) => Value::SmallInt(n.wrapping_add(1)),
        Value::Int(n) => Value::Int(n.wrapping_add(1)),
        Value::BigInt(n) => Value::BigInt(n.wrapping_add(1)),
        // Strictly increasing even within one clock tick.
        Value::Timestamp(prev) => Value::Timestamp(now_micros().max(prev.saturating_add(1))),
        Value::TimestampTz(prev) => Value::TimestampTz(now_micros().max(prev.saturating_add(1))),
        _ => initial_version(prop),
    }
}

fn owning_collection_changes(entity: &Entity) -> Vec<CollectionChange> {
    entity
        .metadata()
        .relations
        .iter()
        .filter(|rel| rel.is_owning_many_to_many())
        .filter_map(|rel| {
            let collection = entity.collection_state(&rel.name)?;
            collection.is_dirty().then(|| CollectionChange {
                relation: rel.name.clone(),
                added: collection.added().to_vec(),
                removed: collection.removed().to_vec(),
            })
        })
        .collect()
}

/// Change set inserting a new entity.
///
/// Every set property and non-null owning reference is a delta. Unset
/// properties with a default are added, and an unset version property
/// starts at its initial value.
pub fn compute_create(entity: &Entity) -> ChangeSet {
    let meta = entity.metadata();
    let mut changes = diff_against(entity, None);
    // Properties appear in declaration order; defaults slot in behind the set ones.
    for prop in &meta.properties {
        if entity.is_set(&prop.name) {
            continue;
        }
        let implied = if prop.version {
            Some(initial_version(prop))
        } else {
            prop.default.clone()
        };
        if let Some(value) = implied {
            changes.push(FieldChange {
                property: prop.name.clone(),
                previous: None,
                current: value,
                kind: ChangeKind::Scalar,
            });
        }
    }
    tracing::trace!(entity = ?entity, fields = changes.len(), "Computed create");
    ChangeSet {
        entity: entity.clone(),
        kind: ChangeSetKind::Create,
        changes,
        collection_changes: owning_collection_changes(entity),
        version: None,
        key: entity.primary_key(),
    }
}

/// Change set updating a managed entity, or `None` when nothing changed.
///
/// Fails when a primary-key property differs from its snapshot.
#[allow(clippy::result_large_err)]
pub fn compute_update(entity: &Entity, snapshot: &EntitySnapshot) -> Result<Option<ChangeSet>> {
    let meta = entity.metadata();
    let mut changes = diff_against(entity, Some(snapshot));

    if let Some(pk) = changes
        .iter()
        .find(|c| meta.is_primary_key(&c.property) && c.previous.is_some())
    {
        return Err(Error::entity(
            EntityErrorKind::KeyChanged,
            &meta.name,
            format!("primary key {} of a managed entity cannot change", pk.property),
        ));
    }

    let version_prop = meta.version();
    if let Some(vp) = version_prop {
        // The session owns the version column.
        changes.retain(|c| c.property != vp.name);
    }
    let collection_changes = owning_collection_changes(entity);
    if changes.is_empty() && collection_changes.is_empty() {
        return Ok(None);
    }

    let mut version = None;
    if let Some(vp) = version_prop {
        // Membership-only changes bump too, so the check reaches the database.
        if let Some(expected) = snapshot.value(&vp.name).filter(|v| !v.is_null()) {
            changes.push(FieldChange {
                property: vp.name.clone(),
                previous: Some(expected.clone()),
                current: next_version(vp, expected),
                kind: ChangeKind::Scalar,
            });
            version = Some(VersionCheck {
                column: vp.column.clone(),
                expected: expected.clone(),
            });
        }
    }

    tracing::trace!(entity = ?entity, fields = changes.len(), "Computed update");
    Ok(Some(ChangeSet {
        entity: entity.clone(),
        kind: ChangeSetKind::Update,
        changes,
        collection_changes,
        version,
        key: snapshot_key(meta, snapshot).or_else(|| entity.primary_key()),
    }))
}

/// Change set deleting a managed entity.
pub fn compute_delete(entity: &Entity, snapshot: &EntitySnapshot) -> ChangeSet {
    let meta = entity.metadata();
    let version = meta.version().and_then(|vp| {
        snapshot
            .value(&vp.name)
            .filter(|v| !v.is_null())
            .map(|expected| VersionCheck {
                column: vp.column.clone(),
                expected: expected.clone(),
            })
    });
    ChangeSet {
        entity: entity.clone(),
        kind: ChangeSetKind::Delete,
        changes: Vec::new(),
        collection_changes: Vec::new(),
        version,
        key: snapshot_key(meta, snapshot).or_else(|| entity.primary_key()),
    }
}

/// Recompute a change set from the entity's current state.
///
/// Used after before-hooks ran, so the last mutation before the statement is
/// built wins. An update that a hook reverted yields `None`.
#[allow(clippy::result_large_err)]
pub(crate) fn recompute(
    change_set: &ChangeSet,
    snapshot: Option<&EntitySnapshot>,
) -> Result<Option<ChangeSet>> {
    match (change_set.kind, snapshot) {
        (ChangeSetKind::Create, _) => Ok(Some(compute_create(&change_set.entity))),
        (ChangeSetKind::Update, Some(snapshot)) => compute_update(&change_set.entity, snapshot),
        _ => Ok(Some(change_set.clone())),
    }
}
