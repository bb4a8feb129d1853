//! Reads: keyed finds, refresh, lazy loading, and merging detached graphs.
//!
//! Every row a read returns goes through hydration, which resolves the
//! concrete type from the discriminator and returns the managed instance
//! when the identity map already holds one for the row's key. A managed
//! instance is never overwritten by a plain read; use `refresh` for that.

use crate::cascade::merge_graph;
use crate::entity::{Collection, Entity, Reference};
use crate::identity_map::IdentityKey;
use crate::{Session, SessionState};
use entmodel_core::{
    Condition, Connection, Cx, EntityErrorKind, EntityMetadata, Error, FindRequest, LockMode,
    MetadataErrorKind, Outcome, PrimaryKey, RelationKind, RelationMetadata, Result, Row, Value,
};
use std::sync::Arc;

fn key_conditions(columns: &[String], key: &PrimaryKey) -> Vec<Condition> {
    columns
        .iter()
        .zip(key.values())
        .map(|(column, value)| Condition::Eq(column.clone(), value.clone()))
        .collect()
}

fn filtered(mut request: FindRequest, conditions: Vec<Condition>) -> FindRequest {
    for condition in conditions {
        request = request.filter(condition);
    }
    request
}

/// Primary key held by a row.
#[allow(clippy::result_large_err)]
fn row_key(meta: &EntityMetadata, row: &Row) -> Result<PrimaryKey> {
    let mut values = Vec::with_capacity(meta.primary_key.len());
    for prop in meta.primary_key_properties() {
        match row.get_by_name(&prop.column).filter(|v| !v.is_null()) {
            Some(value) => values.push(prop.from_database(value)?),
            None => {
                return Err(Error::entity(
                    EntityErrorKind::MissingKey,
                    &meta.name,
                    format!("row has no value for key column {}", prop.column),
                ));
            }
        }
    }
    Ok(PrimaryKey::new(values))
}

/// Converted values of the properties `include` selects.
#[allow(clippy::result_large_err)]
fn row_values(
    meta: &EntityMetadata,
    row: &Row,
    include: impl Fn(&str, bool) -> bool,
) -> Result<Vec<(String, Value)>> {
    let mut values = Vec::new();
    for prop in &meta.properties {
        if !include(&prop.name, prop.lazy) {
            continue;
        }
        if let Some(value) = row.get_by_name(&prop.column) {
            values.push((prop.name.clone(), prop.from_database(value)?));
        }
    }
    Ok(values)
}

fn unknown_relation(meta: &EntityMetadata, relation: &str, what: &str) -> Error {
    Error::metadata(
        MetadataErrorKind::UnknownProperty,
        &meta.name,
        format!("no {} named '{}'", what, relation),
    )
}

fn no_owning_side(meta: &EntityMetadata, relation: &str) -> Error {
    Error::metadata(
        MetadataErrorKind::UnresolvedRelation,
        &meta.name,
        format!("relation '{}' has no owning side", relation),
    )
}

fn with_collection(entity: &Entity, relation: &str, f: impl FnOnce(&mut Collection)) {
    let mut data = entity.write();
    f(data.collections.entry(relation.to_string()).or_default());
}

impl<C: Connection> Session<C> {
    async fn query(&self, cx: &Cx, request: &FindRequest) -> Outcome<Vec<Row>, Error> {
        tracing::debug!(
            session = self.id,
            table = %request.table,
            conditions = request.conditions.len(),
            lock = ?request.lock,
            "Executing find"
        );
        match self.conn.find(cx, request).await {
            Outcome::Err(e) => Outcome::Err(e.translate()),
            other => other,
        }
    }

    /// Restrict a read of a subtype to rows of that subtype.
    fn discriminator_filter(&self, meta: &EntityMetadata) -> Option<Condition> {
        let column = meta.discriminator_column.as_ref()?;
        meta.extends.as_ref()?;
        Some(Condition::In(
            column.clone(),
            self.registry.discriminator_values(meta),
        ))
    }

    /// To-one references held by a row's foreign-key columns.
    fn row_references(
        &self,
        state: &SessionState,
        meta: &EntityMetadata,
        row: &Row,
    ) -> Vec<(String, Option<Reference>)> {
        let mut references = Vec::new();
        for rel in meta.owning_to_one() {
            if !rel.join_columns.iter().any(|c| row.contains_column(c)) {
                continue;
            }
            let values: Vec<Value> = rel
                .join_columns
                .iter()
                .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
                .collect();
            let reference = if values.iter().all(Value::is_null) {
                None
            } else {
                let key = PrimaryKey::new(values);
                let loaded = self
                    .registry
                    .get(&rel.target)
                    .and_then(|target| state.identity.find(target, &key))
                    .cloned();
                Some(match loaded {
                    Some(target) => Reference::Loaded(target),
                    None => Reference::Unloaded(key),
                })
            };
            references.push((rel.name.clone(), reference));
        }
        references
    }

    /// Materialize a row as a managed entity.
    ///
    /// Returns the managed instance when the row's key is already mapped.
    #[allow(clippy::result_large_err)]
    pub(crate) fn hydrate(&self, meta: &Arc<EntityMetadata>, row: &Row) -> Result<Entity> {
        let discriminator = meta
            .discriminator_column
            .as_deref()
            .and_then(|column| row.get_by_name(column))
            .filter(|v| !v.is_null());
        let concrete = Arc::clone(self.registry.concrete_type(meta, discriminator));
        let key = row_key(&concrete, row)?;
        let identity_key = IdentityKey::for_type(&concrete, &key);

        let mut state = self.lock();
        if let Some(existing) = state.identity.get(&identity_key) {
            tracing::trace!(key = %identity_key, "Identity map hit on hydrate");
            return Ok(existing.clone());
        }
        let values = row_values(&concrete, row, |_, lazy| !lazy)?;
        let references = self.row_references(&state, &concrete, row);

        let entity = Entity::hydrated(&concrete);
        {
            let mut data = entity.write();
            data.values.extend(values);
            data.references.extend(references);
        }
        let entity = state.identity.register(entity, identity_key);
        state.snapshots.capture(&entity);
        entity.bind_session(self.id);
        Ok(entity)
    }

    #[allow(clippy::result_large_err)]
    fn hydrate_all(&self, meta: &Arc<EntityMetadata>, rows: &[Row]) -> Result<Vec<Entity>> {
        rows.iter().map(|row| self.hydrate(meta, row)).collect()
    }

    /// Find an entity by primary key.
    ///
    /// Without a lock the identity map answers first and no query is sent
    /// for a managed key. With a lock the row is always read so the driver
    /// can take the lock; the managed instance is still what comes back.
    #[tracing::instrument(level = "debug", skip(self, cx, key), fields(session = self.id, key = %key))]
    pub async fn find(
        &self,
        cx: &Cx,
        entity_type: &str,
        key: PrimaryKey,
        lock: LockMode,
    ) -> Outcome<Option<Entity>, Error> {
        let meta = Arc::clone(try_result!(self.registry.require(entity_type)));
        if key.len() != meta.primary_key.len() {
            return Outcome::Err(Error::entity(
                EntityErrorKind::KeyArity,
                &meta.name,
                format!(
                    "primary key has {} columns, got {} values",
                    meta.primary_key.len(),
                    key.len()
                ),
            ));
        }

        if lock == LockMode::None {
            let hit = self.lock().identity.find(&meta, &key).cloned();
            if let Some(entity) = hit {
                // A managed instance of a sibling subtype does not match.
                let matches = self.registry.inherits_from(entity.metadata(), &meta.name);
                return Outcome::Ok(matches.then_some(entity));
            }
        }

        let mut conditions = key_conditions(&meta.primary_key_columns(), &key);
        conditions.extend(self.discriminator_filter(&meta));
        let request = filtered(FindRequest::new(meta.table.clone()), conditions)
            .lock(lock)
            .limit(1);
        let rows = try_outcome!(self.query(cx, &request).await);
        match rows.first() {
            Some(row) => Outcome::Ok(Some(try_result!(self.hydrate(&meta, row)))),
            None => Outcome::Ok(None),
        }
    }

    /// Find every entity of a type matching all `conditions`.
    ///
    /// Conditions name columns, not properties.
    #[tracing::instrument(level = "debug", skip(self, cx, conditions), fields(session = self.id))]
    pub async fn find_by(
        &self,
        cx: &Cx,
        entity_type: &str,
        conditions: Vec<Condition>,
    ) -> Outcome<Vec<Entity>, Error> {
        let meta = Arc::clone(try_result!(self.registry.require(entity_type)));
        let mut conditions = conditions;
        conditions.extend(self.discriminator_filter(&meta));
        let request = filtered(FindRequest::new(meta.table.clone()), conditions);
        let rows = try_outcome!(self.query(cx, &request).await);
        Outcome::Ok(try_result!(self.hydrate_all(&meta, &rows)))
    }

    /// Reload a managed entity's state from its row.
    ///
    /// Pending in-memory changes are discarded and the snapshot is
    /// re-captured. Lazy properties that were never loaded stay unloaded.
    /// Returns false when the row no longer exists.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(session = self.id, entity = ?entity))]
    pub async fn refresh(&self, cx: &Cx, entity: &Entity) -> Outcome<bool, Error> {
        if entity.session_id() != self.id {
            return Outcome::Err(Error::entity(
                EntityErrorKind::NotManaged,
                entity.entity_type(),
                format!("{:?} is not managed by this session", entity),
            ));
        }
        let meta = Arc::clone(entity.metadata());
        let Some(key) = entity.primary_key() else {
            return Outcome::Err(Error::entity(
                EntityErrorKind::MissingKey,
                entity.entity_type(),
                format!("cannot refresh {:?} before it has a primary key", entity),
            ));
        };
        let request = filtered(
            FindRequest::new(meta.table.clone()),
            key_conditions(&meta.primary_key_columns(), &key),
        )
        .limit(1);
        let rows = try_outcome!(self.query(cx, &request).await);
        let Some(row) = rows.first() else {
            return Outcome::Ok(false);
        };

        let values = try_result!(row_values(&meta, row, |name, lazy| {
            !lazy || entity.is_set(name)
        }));
        let mut state = self.lock();
        let references = self.row_references(&state, &meta, row);
        {
            let mut data = entity.write();
            data.values.extend(values);
            data.references.extend(references);
        }
        state.snapshots.capture(entity);
        Outcome::Ok(true)
    }

    /// Load one lazy property.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(session = self.id, entity = ?entity))]
    pub async fn load_property(&self, cx: &Cx, entity: &Entity, property: &str) -> Outcome<Value, Error> {
        let meta = Arc::clone(entity.metadata());
        let Some(prop) = meta.get_property(property) else {
            return Outcome::Err(unknown_relation(&meta, property, "property"));
        };
        if let Some(value) = entity.get(property) {
            return Outcome::Ok(value);
        }
        let Some(key) = entity.primary_key() else {
            return Outcome::Ok(Value::Null);
        };
        let request = filtered(
            FindRequest::new(meta.table.clone()),
            key_conditions(&meta.primary_key_columns(), &key),
        )
        .limit(1);
        let rows = try_outcome!(self.query(cx, &request).await);
        let Some(raw) = rows.first().and_then(|row| row.get_by_name(&prop.column)) else {
            return Outcome::Err(Error::entity(
                EntityErrorKind::RowNotFound,
                entity.entity_type(),
                format!("row of {:?} not found while loading {}", entity, property),
            ));
        };
        let value = try_result!(prop.from_database(raw));
        entity
            .write()
            .values
            .insert(property.to_string(), value.clone());
        self.lock().snapshots.record(entity, property, value.clone());
        Outcome::Ok(value)
    }

    /// Load the target of a to-one relation.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(session = self.id, entity = ?entity))]
    pub async fn load_reference(
        &self,
        cx: &Cx,
        entity: &Entity,
        relation: &str,
    ) -> Outcome<Option<Entity>, Error> {
        let meta = Arc::clone(entity.metadata());
        let rel = match meta.get_relation(relation) {
            Some(rel) if rel.kind.is_to_one() => rel.clone(),
            _ => return Outcome::Err(unknown_relation(&meta, relation, "to-one relation")),
        };
        let target_meta = Arc::clone(try_result!(self.registry.require(&rel.target)));

        match entity.reference(relation) {
            Some(Some(Reference::Loaded(target))) => return Outcome::Ok(Some(target)),
            Some(Some(Reference::Unloaded(key))) => {
                let found = try_outcome!(self.find(cx, &target_meta.name, key, LockMode::None).await);
                if let Some(target) = &found {
                    entity.set_reference_raw(relation, Some(Reference::Loaded(target.clone())));
                }
                return Outcome::Ok(found);
            }
            Some(None) => return Outcome::Ok(None),
            None if rel.owner => return Outcome::Ok(None),
            None => {}
        }

        // Inverse one-to-one: the target's row holds the foreign key.
        let Some(owning) = rel
            .mapped_by
            .as_deref()
            .and_then(|name| target_meta.get_relation(name))
        else {
            return Outcome::Err(no_owning_side(&meta, relation));
        };
        let Some(key) = entity.primary_key() else {
            return Outcome::Ok(None);
        };
        let mut conditions = key_conditions(&owning.join_columns, &key);
        conditions.extend(self.discriminator_filter(&target_meta));
        let request = filtered(FindRequest::new(target_meta.table.clone()), conditions).limit(1);
        let rows = try_outcome!(self.query(cx, &request).await);
        let found = match rows.first() {
            Some(row) => Some(try_result!(self.hydrate(&target_meta, row))),
            None => None,
        };
        entity.set_reference_raw(relation, found.clone().map(Reference::Loaded));
        Outcome::Ok(found)
    }

    /// Initialize a to-many relation from the database.
    ///
    /// Pending adds and removes are folded into the loaded items. A failed
    /// load leaves the collection uninitialized.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(session = self.id, entity = ?entity))]
    pub async fn load_collection(
        &self,
        cx: &Cx,
        entity: &Entity,
        relation: &str,
    ) -> Outcome<Vec<Entity>, Error> {
        let meta = Arc::clone(entity.metadata());
        let rel = match meta.get_relation(relation) {
            Some(rel) if rel.kind.is_to_many() => rel.clone(),
            _ => return Outcome::Err(unknown_relation(&meta, relation, "to-many relation")),
        };
        if let Some(items) = entity.collection(relation) {
            return Outcome::Ok(items);
        }

        with_collection(entity, relation, Collection::begin_load);
        let loaded = match entity.primary_key() {
            Some(key) => self.fetch_collection(cx, &rel, &key).await,
            None => Outcome::Ok(Vec::new()),
        };
        match loaded {
            Outcome::Ok(items) => {
                tracing::trace!(relation, items = items.len(), "Collection loaded");
                with_collection(entity, relation, |c| c.finish_load(items));
                Outcome::Ok(entity.collection(relation).unwrap_or_default())
            }
            other => {
                with_collection(entity, relation, Collection::abort_load);
                other
            }
        }
    }

    async fn fetch_collection(
        &self,
        cx: &Cx,
        rel: &RelationMetadata,
        key: &PrimaryKey,
    ) -> Outcome<Vec<Entity>, Error> {
        let target_meta = Arc::clone(try_result!(self.registry.require(&rel.target)));
        let owning = rel
            .mapped_by
            .as_deref()
            .and_then(|name| target_meta.get_relation(name));

        if rel.kind == RelationKind::OneToMany {
            let Some(owning) = owning else {
                return Outcome::Err(no_owning_side(&target_meta, &rel.name));
            };
            let mut conditions = key_conditions(&owning.join_columns, key);
            conditions.extend(self.discriminator_filter(&target_meta));
            let request = filtered(FindRequest::new(target_meta.table.clone()), conditions);
            let rows = try_outcome!(self.query(cx, &request).await);
            return Outcome::Ok(try_result!(self.hydrate_all(&target_meta, &rows)));
        }

        // Many-to-many: read the pivot, then the targets it names.
        let pivot = if rel.owner {
            rel.pivot.clone()
        } else {
            owning.and_then(|o| o.pivot.clone()).map(|mut p| {
                std::mem::swap(&mut p.owner_columns, &mut p.target_columns);
                p
            })
        };
        let Some(pivot) = pivot else {
            return Outcome::Err(no_owning_side(&target_meta, &rel.name));
        };
        let request = filtered(
            FindRequest::new(pivot.table.clone()),
            key_conditions(&pivot.owner_columns, key),
        );
        let links = try_outcome!(self.query(cx, &request).await);

        let mut items = Vec::with_capacity(links.len());
        for link in &links {
            let values: Option<Vec<Value>> = pivot
                .target_columns
                .iter()
                .map(|c| link.get_by_name(c).cloned())
                .collect();
            let Some(values) = values else { continue };
            let target_key = PrimaryKey::new(values);
            if let Some(target) =
                try_outcome!(self.find(cx, &target_meta.name, target_key, LockMode::None).await)
            {
                items.push(target);
            }
        }
        Outcome::Ok(items)
    }

    /// Copy the state of a detached graph onto managed instances.
    ///
    /// Walks cascade-merge relations from `entity`. Each instance with a key
    /// folds into the managed instance for that key, loading it if needed;
    /// instances without a key, or whose row does not exist, are persisted
    /// as new copies. The detached graph itself is never attached. Returns
    /// the managed counterpart of `entity`.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(session = self.id, entity = ?entity))]
    pub async fn merge(&self, cx: &Cx, entity: &Entity) -> Outcome<Entity, Error> {
        let graph = merge_graph(entity);
        let mut resolved: Vec<(Entity, Entity)> = Vec::with_capacity(graph.len());
        for source in graph {
            let managed = try_outcome!(self.merge_target(cx, &source).await);
            resolved.push((source, managed));
        }

        // Targets outside the merged graph resolve through the identity map.
        let counterpart = |e: &Entity| -> Option<Entity> {
            if let Some((_, managed)) = resolved.iter().find(|(source, _)| source.ptr_eq(e)) {
                return Some(managed.clone());
            }
            if e.session_id() == self.id && self.contains(e) {
                return Some(e.clone());
            }
            let key = e.primary_key()?;
            self.lock().identity.find(e.metadata(), &key).cloned()
        };
        for (source, managed) in &resolved {
            if !source.ptr_eq(managed) {
                try_result!(copy_state(source, managed, &counterpart));
            }
        }
        match resolved.into_iter().next() {
            Some((_, managed)) => Outcome::Ok(managed),
            None => Outcome::Ok(entity.clone()),
        }
    }

    /// Managed instance a merged entity folds into.
    async fn merge_target(&self, cx: &Cx, source: &Entity) -> Outcome<Entity, Error> {
        if source.session_id() == self.id && self.contains(source) {
            return Outcome::Ok(source.clone());
        }
        let meta = Arc::clone(source.metadata());
        if let Some(key) = source.primary_key() {
            let hit = self.lock().identity.find(&meta, &key).cloned();
            if let Some(managed) = hit {
                return Outcome::Ok(managed);
            }
            if let Some(found) = try_outcome!(self.find(cx, &meta.name, key, LockMode::None).await) {
                return Outcome::Ok(found);
            }
        }
        let copy = Entity::new(&meta);
        {
            let values = source.read().values.clone();
            copy.write().values.extend(values);
        }
        try_result!(self.persist(&copy));
        tracing::trace!(source = ?source, copy = ?copy, "Merged as new entity");
        Outcome::Ok(copy)
    }
}

/// Copy scalar values, references and collection membership.
///
/// A loaded target with no managed counterpart is written as an unloaded
/// reference by key; one without a key leaves the managed reference alone.
/// Collection items with no managed counterpart are neither added nor
/// removed.
#[allow(clippy::result_large_err)]
fn copy_state(
    source: &Entity,
    managed: &Entity,
    counterpart: &impl Fn(&Entity) -> Option<Entity>,
) -> Result<()> {
    let (values, references) = {
        let data = source.read();
        (data.values.clone(), data.references.clone())
    };
    managed.write().values.extend(values);

    for (name, reference) in references {
        match reference {
            Some(Reference::Loaded(target)) => match counterpart(&target) {
                Some(resolved) => managed.set_reference(&name, Some(&resolved))?,
                None => match target.primary_key() {
                    Some(key) => managed.set_reference_raw(&name, Some(Reference::Unloaded(key))),
                    None => tracing::warn!(
                        entity = ?source,
                        relation = %name,
                        target = ?target,
                        "Merged reference targets a new entity outside the merge; skipping"
                    ),
                },
            },
            other => managed.set_reference_raw(&name, other),
        }
    }

    for rel in source.metadata().collections() {
        let Some(items) = source.collection(&rel.name) else {
            continue;
        };
        let (resolved, unresolved): (Vec<_>, Vec<_>) =
            items.iter().map(|item| (item, counterpart(item))).partition(|(_, c)| c.is_some());
        let items: Vec<Entity> = resolved.into_iter().filter_map(|(_, c)| c).collect();
        let unresolved_keys: Vec<_> = unresolved
            .iter()
            .filter_map(|(item, _)| item.primary_key())
            .collect();
        let current = managed.collection(&rel.name);
        for item in &items {
            if !current.as_ref().is_some_and(|c| c.iter().any(|e| e.ptr_eq(item))) {
                managed.add(&rel.name, item)?;
            }
        }
        for existing in current.unwrap_or_default() {
            let kept = items.iter().any(|item| item.ptr_eq(&existing))
                || existing
                    .primary_key()
                    .is_some_and(|k| unresolved_keys.contains(&k));
            if !kept {
                managed.remove_item(&rel.name, &existing)?;
            }
        }
    }
    Ok(())
}
