//! Flush execution: turning an ordered plan into driver statements.
//!
//! The executor runs inside the flush transaction and never touches session
//! state. Everything the session must apply once the transaction commits
//! (generated keys, implied defaults, bumped versions) is collected in
//! pending writes instead of being written to the entities directly, so a
//! failed flush leaves every instance exactly as the caller left it.
//!
//! Batching rules:
//! - inserts: consecutive rows of one type with identical columns share a
//!   statement when the driver accepts multi-row inserts, unless a row
//!   references another row of the same batch. Rows waiting on a generated
//!   key are inserted one by one when the driver can neither return nor
//!   sequence them
//! - updates: consecutive rows of one table with identical columns and no
//!   version check share a statement when the driver accepts it
//! - deletes: consecutive unversioned keys of one table share a statement
//!   when the driver accepts batched deletes

use crate::change_set::{ChangeSet, recompute};
use crate::entity::{Entity, EntityId};
use crate::events::{EventArgs, EventType, Hooks};
use crate::ordering::{self, DeferredForeignKey, FlushPlan, PivotLink, PivotPurge};
use crate::snapshot::{ChangeKind, EntitySnapshot, FieldChange};
use entmodel_core::{
    Capabilities, Condition, Connection, Cx, DeleteRow, DeleteStatement, EntityErrorKind,
    EntityMetadata, Error, FindRequest, InsertStatement, MetadataRegistry, OptimisticLockError,
    Outcome, PrimaryKey, QueryResult, RelationMetadata, Result, Row, Statement, UpdateRow,
    UpdateStatement, Value,
};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

/// Where a flush currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushState {
    #[default]
    Idle,
    /// Expanding cascades and computing change sets
    Computing,
    /// Ordering change sets
    Sorting,
    /// Executing statements
    Executing,
    /// Committing the flush transaction
    Committing,
    /// Rolling back after a failure
    RollingBack,
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted
    pub inserted: usize,
    /// Number of rows updated
    pub updated: usize,
    /// Number of rows deleted
    pub deleted: usize,
    /// Number of statements sent to the driver
    pub statements: usize,
}

impl FlushResult {
    /// Whether the flush wrote anything.
    pub fn is_empty(&self) -> bool {
        self.statements == 0
    }
}

/// A value the session writes into an entity once the flush commits.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    pub(crate) entity: Entity,
    pub(crate) property: String,
    pub(crate) value: Value,
}

#[derive(Debug, Default)]
struct InsertRow {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl InsertRow {
    fn push(&mut self, column: &str, value: Value) {
        self.columns.push(column.to_string());
        self.values.push(value);
    }
}

/// Consecutive runs of compatible items, each at most `limit` long.
fn runs<T>(items: &[T], limit: usize, same: impl Fn(&T, &T) -> bool) -> Vec<Range<usize>> {
    let limit = limit.max(1);
    let mut out = Vec::new();
    let mut start = 0;
    while start < items.len() {
        let mut end = start + 1;
        while end < items.len() && end - start < limit && same(&items[start], &items[end]) {
            end += 1;
        }
        out.push(start..end);
        start = end;
    }
    out
}

fn key_values(key: &PrimaryKey) -> Vec<Value> {
    key.values().to_vec()
}

/// Key of `meta` built from `supplied` values, falling back to the entity.
fn key_with(meta: &EntityMetadata, entity: &Entity, supplied: &[(String, Value)]) -> Option<PrimaryKey> {
    let values: Option<Vec<Value>> = meta
        .primary_key
        .iter()
        .map(|name| {
            supplied
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .or_else(|| entity.get(name))
                .filter(|v| !v.is_null())
        })
        .collect();
    values.map(PrimaryKey::new)
}

/// Whether inserting `change_set` relies on the database for its key.
fn needs_generated_key(change_set: &ChangeSet) -> bool {
    let meta = change_set.entity.metadata();
    meta.primary_key_properties().any(|p| {
        p.auto_increment
            && change_set
                .entity
                .get(&p.name)
                .is_none_or(|v| v.is_null())
    })
}

/// Executes one flush plan against a connection.
pub(crate) struct FlushExecutor<'a, C: Connection> {
    conn: &'a C,
    registry: &'a MetadataRegistry,
    hooks: &'a Hooks,
    caps: Capabilities,
    batch_size: usize,
    /// Snapshots of updated entities, for recomputing after hooks
    baselines: HashMap<EntityId, EntitySnapshot>,
    /// Keys the database generated for new entities
    generated: HashMap<EntityId, PrimaryKey>,
    writes: Vec<PendingWrite>,
    result: FlushResult,
}

impl<'a, C: Connection> FlushExecutor<'a, C> {
    pub(crate) fn new(
        conn: &'a C,
        registry: &'a MetadataRegistry,
        hooks: &'a Hooks,
        batch_size: usize,
        baselines: HashMap<EntityId, EntitySnapshot>,
    ) -> Self {
        Self {
            caps: conn.capabilities(),
            conn,
            registry,
            hooks,
            batch_size: batch_size.max(1),
            baselines,
            generated: HashMap::new(),
            writes: Vec::new(),
            result: FlushResult::default(),
        }
    }

    /// Counters so far.
    pub(crate) fn result(&self) -> FlushResult {
        self.result
    }

    /// Values to write into entities once the flush commits.
    pub(crate) fn into_writes(self) -> Vec<PendingWrite> {
        self.writes
    }

    /// Run every statement of `plan` in order.
    ///
    /// On success `plan` holds the change sets as they were executed, after
    /// before-hooks had their say. Updates a hook reverted are dropped.
    #[tracing::instrument(level = "debug", skip_all)]
    pub(crate) async fn execute(&mut self, cx: &Cx, plan: &mut FlushPlan) -> Outcome<(), Error> {
        let deferred = plan.deferred.clone();

        let creates = std::mem::take(&mut plan.creates);
        plan.creates = try_outcome!(self.run_creates(cx, creates, &deferred).await);

        let updates = std::mem::take(&mut plan.updates);
        plan.updates = try_outcome!(self.run_updates(cx, updates).await);

        try_outcome!(self.run_foreign_keys(cx, &deferred).await);

        // Hooks may have touched collections; derive pivot rows afresh.
        plan.unlinks.clear();
        plan.links.clear();
        plan.purges.clear();
        ordering::pivots(self.registry, plan);
        try_outcome!(self.run_unlinks(cx, &plan.unlinks).await);
        try_outcome!(self.run_purges(cx, &plan.purges).await);
        try_outcome!(self.run_links(cx, &plan.links).await);

        let nullified = plan.nullified.clone();
        try_outcome!(self.run_foreign_keys(cx, &nullified).await);

        let deletes = std::mem::take(&mut plan.deletes);
        plan.deletes = try_outcome!(self.run_deletes(cx, deletes).await);

        tracing::debug!(
            inserted = self.result.inserted,
            updated = self.result.updated,
            deleted = self.result.deleted,
            statements = self.result.statements,
            "Flush statements executed"
        );
        Outcome::Ok(())
    }

    async fn exec(&mut self, cx: &Cx, statement: &Statement) -> Outcome<QueryResult, Error> {
        tracing::debug!(
            kind = statement.kind(),
            table = statement.table(),
            rows = statement.row_count(),
            "Executing statement"
        );
        self.result.statements += 1;
        match self.conn.execute(cx, statement).await {
            Outcome::Err(e) => Outcome::Err(e.translate()),
            other => other,
        }
    }

    /// Fire the before-hook of `change_set`, then recompute it.
    async fn prepare(&self, cx: &Cx, change_set: ChangeSet) -> Outcome<Option<ChangeSet>, Error> {
        let args = EventArgs::entity(EventType::before(change_set.kind), &change_set);
        try_result!(self.hooks.fire(cx, self.registry, &args).await);
        let baseline = self.baselines.get(&change_set.entity.id());
        Outcome::Ok(try_result!(recompute(&change_set, baseline)))
    }

    fn key_of(&self, entity: &Entity) -> Option<PrimaryKey> {
        entity
            .primary_key()
            .or_else(|| self.generated.get(&entity.id()).cloned())
    }

    fn lock_error(change_set: &ChangeSet, expected: u64, affected: u64) -> Error {
        Error::OptimisticLock(OptimisticLockError {
            entity: change_set.entity_type().to_string(),
            key: change_set
                .key
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            expected_version: change_set.version.as_ref().map(|v| v.expected.clone()),
            expected_rows: expected,
            affected_rows: affected,
        })
    }

    /// Key written into the join columns of a reference delta.
    fn reference_key(&self, entity: &Entity, rel: &RelationMetadata, change: &FieldChange) -> Option<PrimaryKey> {
        match &change.kind {
            ChangeKind::Reference {
                target: Some(target),
            } => {
                let key = self.key_of(target);
                if key.is_none() {
                    tracing::warn!(
                        entity = ?entity,
                        relation = %rel.name,
                        target = ?target,
                        "Referenced entity has no key; writing NULL"
                    );
                }
                key
            }
            _ => match &change.current {
                Value::Null => None,
                Value::Array(values) => Some(PrimaryKey::new(values.clone())),
                value => Some(PrimaryKey::single(value.clone())),
            },
        }
    }

    fn join_values(rel: &RelationMetadata, key: Option<&PrimaryKey>) -> Vec<Value> {
        (0..rel.join_columns.len())
            .map(|i| {
                key.and_then(|k| k.values().get(i).cloned())
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Column values of one changed field, in statement order.
    #[allow(clippy::result_large_err)]
    fn field_columns(
        &self,
        change_set: &ChangeSet,
        change: &FieldChange,
        deferred: &[DeferredForeignKey],
        out: &mut InsertRow,
    ) -> Result<()> {
        let meta = change_set.entity.metadata();
        match &change.kind {
            ChangeKind::Scalar => {
                let Some(prop) = meta.get_property(&change.property) else {
                    return Ok(());
                };
                if change_set.is_create() && prop.database_supplied() && change.current.is_null() {
                    return Ok(());
                }
                out.push(&prop.column, prop.to_database(&change.current)?);
            }
            ChangeKind::Reference { .. } => {
                let Some(rel) = meta.get_relation(&change.property) else {
                    return Ok(());
                };
                let is_deferred = deferred
                    .iter()
                    .any(|d| d.entity.ptr_eq(&change_set.entity) && d.relation == rel.name);
                let key = if is_deferred {
                    None
                } else {
                    self.reference_key(&change_set.entity, rel, change)
                };
                for (column, value) in rel.join_columns.iter().zip(Self::join_values(rel, key.as_ref())) {
                    out.push(column, value);
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn insert_row(&self, change_set: &ChangeSet, deferred: &[DeferredForeignKey]) -> Result<InsertRow> {
        let meta = change_set.entity.metadata();
        let mut row = InsertRow::default();
        for change in &change_set.changes {
            self.field_columns(change_set, change, deferred, &mut row)?;
        }
        if let (Some(column), Some(value)) = (&meta.discriminator_column, &meta.discriminator_value) {
            if !row.columns.contains(column) {
                row.push(column, value.clone());
            }
        }
        Ok(row)
    }

    /// Whether the driver can hand back every row's key of a multi-row
    /// insert.
    fn batch_keys_known(&self) -> bool {
        self.caps.returning || self.caps.sequential_insert_ids
    }

    /// End of the insert batch starting at `start`.
    fn batch_end(&self, creates: &[ChangeSet], start: usize) -> usize {
        let limit = if self.caps.multi_row_insert {
            self.batch_size
        } else {
            1
        };
        let entity_type = creates[start].entity_type();
        let per_row_keys = !self.batch_keys_known();
        let mut end = start + 1;
        while end < creates.len() && end - start < limit {
            let next = &creates[end];
            if next.entity_type() != entity_type {
                break;
            }
            if per_row_keys && (needs_generated_key(&creates[start]) || needs_generated_key(next)) {
                break;
            }
            let depends = next
                .referenced()
                .any(|(_, target)| creates[start..end].iter().any(|m| m.entity.ptr_eq(target)));
            if depends {
                break;
            }
            end += 1;
        }
        end
    }

    async fn run_creates(
        &mut self,
        cx: &Cx,
        creates: Vec<ChangeSet>,
        deferred: &[DeferredForeignKey],
    ) -> Outcome<Vec<ChangeSet>, Error> {
        let mut done = Vec::with_capacity(creates.len());
        let mut start = 0;
        while start < creates.len() {
            let end = self.batch_end(&creates, start);
            let mut group = Vec::with_capacity(end - start);
            for change_set in &creates[start..end] {
                if let Some(cs) = try_outcome!(self.prepare(cx, change_set.clone()).await) {
                    group.push(cs);
                }
            }
            start = end;

            let mut rows = Vec::with_capacity(group.len());
            for change_set in &group {
                rows.push(try_result!(self.insert_row(change_set, deferred)));
            }
            for range in runs(&rows, usize::MAX, |a, b| a.columns == b.columns) {
                try_outcome!(
                    self.insert_batch(cx, &mut group[range.clone()], &rows[range])
                        .await
                );
            }
            done.extend(group);
        }
        Outcome::Ok(done)
    }

    async fn insert_batch(
        &mut self,
        cx: &Cx,
        group: &mut [ChangeSet],
        rows: &[InsertRow],
    ) -> Outcome<(), Error> {
        let Some(first) = group.first() else {
            return Outcome::Ok(());
        };
        let meta = Arc::clone(first.entity.metadata());
        let columns = rows[0].columns.clone();
        let returning: Vec<String> = if self.caps.returning {
            meta.properties
                .iter()
                .filter(|p| p.database_supplied() && !columns.contains(&p.column))
                .map(|p| p.column.clone())
                .collect()
        } else {
            Vec::new()
        };
        let statement = Statement::Insert(InsertStatement {
            table: meta.table.clone(),
            columns: columns.clone(),
            rows: rows.iter().map(|r| r.values.clone()).collect(),
            returning: returning.clone(),
        });
        let result = try_outcome!(self.exec(cx, &statement).await);

        for (i, change_set) in group.iter_mut().enumerate() {
            let entity = change_set.entity.clone();

            // Defaults and initial versions the entity never held.
            for change in &change_set.changes {
                if matches!(change.kind, ChangeKind::Scalar) && !entity.is_set(&change.property) {
                    self.writes.push(PendingWrite {
                        entity: entity.clone(),
                        property: change.property.clone(),
                        value: change.current.clone(),
                    });
                }
            }

            let mut supplied: Vec<(String, Value)> = Vec::new();
            if let Some(row) = result.rows.get(i) {
                for column in &returning {
                    let (Some(prop), Some(value)) = (
                        meta.properties.iter().find(|p| &p.column == column),
                        row.get_by_name(column),
                    ) else {
                        continue;
                    };
                    supplied.push((prop.name.clone(), try_result!(prop.from_database(value))));
                }
            } else if let Some(first_id) = result
                .insert_id
                .filter(|_| i == 0 || self.caps.sequential_insert_ids)
            {
                let pk: Vec<_> = meta.primary_key_properties().collect();
                if let [pk] = pk.as_slice() {
                    let unset = entity.get(&pk.name).is_none_or(|v| v.is_null());
                    if pk.auto_increment && unset {
                        let offset = i64::try_from(i).unwrap_or(i64::MAX);
                        supplied.push((pk.name.clone(), Value::BigInt(first_id.saturating_add(offset))));
                    }
                }
            }

            let Some(key) = key_with(&meta, &entity, &supplied) else {
                return Outcome::Err(Error::entity(
                    EntityErrorKind::MissingKey,
                    &meta.name,
                    "driver returned no key for the inserted row",
                ));
            };
            if entity.primary_key().is_none() {
                self.generated.insert(entity.id(), key.clone());
            }
            change_set.key = Some(key.clone());

            // Generated columns the driver did not hand back.
            let missing: Vec<_> = meta
                .properties
                .iter()
                .filter(|p| p.generated && !p.primary_key)
                .filter(|p| !columns.contains(&p.column))
                .filter(|p| !supplied.iter().any(|(n, _)| n == &p.name))
                .collect();
            if !missing.is_empty() {
                if let Some(row) = try_outcome!(self.fetch_row(cx, &meta, &key).await) {
                    for prop in missing {
                        if let Some(value) = row.get_by_name(&prop.column) {
                            supplied.push((prop.name.clone(), try_result!(prop.from_database(value))));
                        }
                    }
                }
            }

            for (property, value) in supplied {
                self.writes.push(PendingWrite {
                    entity: entity.clone(),
                    property,
                    value,
                });
            }
            self.result.inserted += 1;
        }
        Outcome::Ok(())
    }

    async fn fetch_row(
        &self,
        cx: &Cx,
        meta: &EntityMetadata,
        key: &PrimaryKey,
    ) -> Outcome<Option<Row>, Error> {
        let mut request = FindRequest::new(meta.table.clone()).limit(1);
        for (column, value) in meta.primary_key_columns().into_iter().zip(key.values()) {
            request = request.filter(Condition::Eq(column, value.clone()));
        }
        match self.conn.find(cx, &request).await {
            Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e.translate()),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn run_updates(&mut self, cx: &Cx, updates: Vec<ChangeSet>) -> Outcome<Vec<ChangeSet>, Error> {
        let mut done = Vec::with_capacity(updates.len());
        for change_set in updates {
            if let Some(cs) = try_outcome!(self.prepare(cx, change_set).await) {
                done.push(cs);
            }
        }

        // Pure collection changes only produce pivot statements.
        let mut rows: Vec<(usize, Vec<String>, UpdateRow)> = Vec::new();
        for (i, change_set) in done.iter().enumerate() {
            if !change_set.has_field_changes() {
                continue;
            }
            let mut set = InsertRow::default();
            for change in &change_set.changes {
                try_result!(self.field_columns(change_set, change, &[], &mut set));
            }
            let Some(key) = change_set.key.as_ref() else {
                return Outcome::Err(Error::entity(
                    EntityErrorKind::MissingKey,
                    change_set.entity_type(),
                    format!("cannot update {:?} without a primary key", change_set.entity),
                ));
            };
            rows.push((
                i,
                set.columns,
                UpdateRow {
                    key: key_values(key),
                    values: set.values,
                    version: change_set.version.clone(),
                },
            ));
        }

        let limit = if self.caps.multi_row_update {
            self.batch_size
        } else {
            1
        };
        let batches = runs(&rows, limit, |(a, ac, ar), (b, bc, br)| {
            done[*a].entity.metadata().table == done[*b].entity.metadata().table
                && ac == bc
                && ar.version.is_none()
                && br.version.is_none()
        });
        for range in batches {
            let batch = &rows[range];
            let (first, columns, _) = &batch[0];
            let meta = Arc::clone(done[*first].entity.metadata());
            let statement = Statement::Update(UpdateStatement {
                table: meta.table.clone(),
                key_columns: meta.primary_key_columns(),
                columns: columns.clone(),
                rows: batch.iter().map(|(_, _, row)| row.clone()).collect(),
            });
            let result = try_outcome!(self.exec(cx, &statement).await);
            let expected = batch.len() as u64;
            if result.affected_rows < expected {
                return Outcome::Err(Self::lock_error(&done[*first], expected, result.affected_rows));
            }
            for (i, _, _) in batch {
                let change_set = &done[*i];
                if let Some(vp) = meta.version() {
                    if let Some(change) = change_set.change(&vp.name) {
                        self.writes.push(PendingWrite {
                            entity: change_set.entity.clone(),
                            property: vp.name.clone(),
                            value: change.current.clone(),
                        });
                    }
                }
                self.result.updated += 1;
            }
        }
        Outcome::Ok(done)
    }

    /// Point (or null) foreign keys written in their own statement.
    async fn run_foreign_keys(&mut self, cx: &Cx, keys: &[DeferredForeignKey]) -> Outcome<(), Error> {
        for fk in keys {
            let meta = Arc::clone(fk.entity.metadata());
            let Some(rel) = meta.get_relation(&fk.relation) else {
                continue;
            };
            let Some(key) = self.key_of(&fk.entity) else {
                return Outcome::Err(Error::entity(
                    EntityErrorKind::MissingKey,
                    &meta.name,
                    format!("cannot write {} of {:?} without a primary key", rel.name, fk.entity),
                ));
            };
            let target_key = fk.target.as_ref().and_then(|t| self.key_of(t));
            let statement = Statement::Update(UpdateStatement {
                table: meta.table.clone(),
                key_columns: meta.primary_key_columns(),
                columns: rel.join_columns.clone(),
                rows: vec![UpdateRow {
                    key: key_values(&key),
                    values: Self::join_values(rel, target_key.as_ref()),
                    version: None,
                }],
            });
            let result = try_outcome!(self.exec(cx, &statement).await);
            if result.affected_rows == 0 {
                return Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                    entity: meta.name.clone(),
                    key: key.to_string(),
                    expected_version: None,
                    expected_rows: 1,
                    affected_rows: 0,
                }));
            }
        }
        Outcome::Ok(())
    }

    /// Owner and target key of a pivot row, or `None` with a warning.
    fn link_key(&self, link: &PivotLink) -> Option<Vec<Value>> {
        match (self.key_of(&link.owner), self.key_of(&link.target)) {
            (Some(owner), Some(target)) => {
                let mut values = owner.into_values();
                values.extend(target.into_values());
                Some(values)
            }
            _ => {
                tracing::warn!(
                    table = %link.table,
                    owner = ?link.owner,
                    target = ?link.target,
                    "Pivot row endpoint has no key; skipping"
                );
                None
            }
        }
    }

    fn link_columns(link: &PivotLink) -> Vec<String> {
        link.owner_columns
            .iter()
            .chain(&link.target_columns)
            .cloned()
            .collect()
    }

    async fn run_unlinks(&mut self, cx: &Cx, unlinks: &[PivotLink]) -> Outcome<(), Error> {
        let keyed: Vec<(&PivotLink, Vec<Value>)> = unlinks
            .iter()
            .filter_map(|l| self.link_key(l).map(|k| (l, k)))
            .collect();
        let limit = if self.caps.batch_delete {
            self.batch_size
        } else {
            1
        };
        for range in runs(&keyed, limit, |(a, _), (b, _)| a.table == b.table) {
            let batch = &keyed[range];
            let statement = Statement::Delete(DeleteStatement {
                table: batch[0].0.table.clone(),
                key_columns: Self::link_columns(batch[0].0),
                rows: batch
                    .iter()
                    .map(|(_, key)| DeleteRow {
                        key: key.clone(),
                        version: None,
                    })
                    .collect(),
            });
            try_outcome!(self.exec(cx, &statement).await);
        }
        Outcome::Ok(())
    }

    async fn run_purges(&mut self, cx: &Cx, purges: &[PivotPurge]) -> Outcome<(), Error> {
        let limit = if self.caps.batch_delete {
            self.batch_size
        } else {
            1
        };
        for range in runs(purges, limit, |a, b| a.table == b.table && a.columns == b.columns) {
            let batch = &purges[range];
            let statement = Statement::Delete(DeleteStatement {
                table: batch[0].table.clone(),
                key_columns: batch[0].columns.clone(),
                rows: batch
                    .iter()
                    .map(|p| DeleteRow {
                        key: key_values(&p.key),
                        version: None,
                    })
                    .collect(),
            });
            try_outcome!(self.exec(cx, &statement).await);
        }
        Outcome::Ok(())
    }

    async fn run_links(&mut self, cx: &Cx, links: &[PivotLink]) -> Outcome<(), Error> {
        let keyed: Vec<(&PivotLink, Vec<Value>)> = links
            .iter()
            .filter_map(|l| self.link_key(l).map(|k| (l, k)))
            .collect();
        let limit = if self.caps.multi_row_insert {
            self.batch_size
        } else {
            1
        };
        for range in runs(&keyed, limit, |(a, _), (b, _)| a.table == b.table) {
            let batch = &keyed[range];
            let statement = Statement::Insert(InsertStatement {
                table: batch[0].0.table.clone(),
                columns: Self::link_columns(batch[0].0),
                rows: batch.iter().map(|(_, key)| key.clone()).collect(),
                returning: Vec::new(),
            });
            try_outcome!(self.exec(cx, &statement).await);
        }
        Outcome::Ok(())
    }

    async fn run_deletes(&mut self, cx: &Cx, deletes: Vec<ChangeSet>) -> Outcome<Vec<ChangeSet>, Error> {
        let mut done = Vec::with_capacity(deletes.len());
        for change_set in deletes {
            if let Some(cs) = try_outcome!(self.prepare(cx, change_set).await) {
                done.push(cs);
            }
        }
        let limit = if self.caps.batch_delete {
            self.batch_size
        } else {
            1
        };
        let batches = runs(&done, limit, |a, b| {
            a.entity.metadata().table == b.entity.metadata().table
                && a.version.is_none()
                && b.version.is_none()
        });
        for range in batches {
            let batch = &done[range];
            let meta = Arc::clone(batch[0].entity.metadata());
            let mut rows = Vec::with_capacity(batch.len());
            for change_set in batch {
                let Some(key) = change_set.key.as_ref() else {
                    return Outcome::Err(Error::entity(
                        EntityErrorKind::MissingKey,
                        change_set.entity_type(),
                        format!("cannot delete {:?} without a primary key", change_set.entity),
                    ));
                };
                rows.push(DeleteRow {
                    key: key_values(key),
                    version: change_set.version.clone(),
                });
            }
            let statement = Statement::Delete(DeleteStatement {
                table: meta.table.clone(),
                key_columns: meta.primary_key_columns(),
                rows,
            });
            let result = try_outcome!(self.exec(cx, &statement).await);
            let expected = batch.len() as u64;
            if result.affected_rows < expected {
                return Outcome::Err(Self::lock_error(&batch[0], expected, result.affected_rows));
            }
            self.result.deleted += batch.len();
        }
        Outcome::Ok(done)
    }
}
