//! Dependency ordering of change sets.
//!
//! Rows must be inserted before the rows referencing them and deleted after
//! them. Change sets form a graph where an edge `A -> B` means A's statement
//! runs first. Edges backed by a non-nullable foreign key are *hard*; edges
//! backed by a nullable one are *soft* and can be broken by writing the
//! foreign key in a second statement:
//!
//! - inserts: insert the referencing row with NULL, then update it once the
//!   referenced row exists
//! - deletes: NULL the referencing column first, then delete in any order
//!
//! The sort is a stable Kahn sort that breaks ties by original position. It
//! first honours every edge; if that fails because of a cycle it re-sorts on
//! hard edges only, preferring nodes whose soft dependencies are already
//! placed, and defers exactly the soft edges the final order violates. A
//! cycle of hard edges cannot be broken and is reported with its path.

use crate::change_set::ChangeSet;
use crate::entity::{Entity, EntityId};
use crate::identity_map::IdentityKey;
use crate::snapshot::SnapshotStore;
use entmodel_core::{Error, MetadataRegistry, OrderingError, PrimaryKey, Result};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A foreign key written in a separate statement.
#[derive(Debug, Clone)]
pub struct DeferredForeignKey {
    pub entity: Entity,
    pub relation: String,
    /// Target to point at once it exists; `None` nulls the column
    pub target: Option<Entity>,
}

/// One pivot row of an owning many-to-many relation.
#[derive(Debug, Clone)]
pub struct PivotLink {
    pub table: String,
    pub owner_columns: Vec<String>,
    pub target_columns: Vec<String>,
    pub owner: Entity,
    pub target: Entity,
}

/// Every pivot row referencing a deleted entity.
#[derive(Debug, Clone)]
pub struct PivotPurge {
    pub table: String,
    pub columns: Vec<String>,
    pub key: PrimaryKey,
}

/// Ordered work of one flush.
///
/// Execution order: creates, updates, deferred foreign keys, pivot deletes
/// (unlinks then purges), pivot inserts, delete nullifications, deletes.
#[derive(Debug, Default)]
pub struct FlushPlan {
    pub creates: Vec<ChangeSet>,
    pub updates: Vec<ChangeSet>,
    pub deferred: Vec<DeferredForeignKey>,
    pub unlinks: Vec<PivotLink>,
    pub purges: Vec<PivotPurge>,
    pub links: Vec<PivotLink>,
    pub nullified: Vec<DeferredForeignKey>,
    pub deletes: Vec<ChangeSet>,
}

impl FlushPlan {
    /// Change sets in execution order.
    pub fn change_sets(&self) -> impl Iterator<Item = &ChangeSet> {
        self.creates
            .iter()
            .chain(&self.updates)
            .chain(&self.deletes)
    }

    /// Whether `entity`'s `relation` is inserted as NULL and set afterwards.
    pub fn is_deferred(&self, entity: &Entity, relation: &str) -> bool {
        self.deferred
            .iter()
            .any(|d| d.entity.ptr_eq(entity) && d.relation == relation)
    }

    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.links.is_empty()
            && self.unlinks.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Edge {
    from: usize,
    to: usize,
    hard: bool,
    /// Node holding the foreign key
    holder: usize,
    relation: String,
}

/// Stable Kahn sort over `hard` edges, preferring nodes whose `soft`
/// predecessors are placed. Returns the unplaced nodes on a cycle.
fn kahn(n: usize, hard: &[&Edge], soft: &[&Edge]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut indegree = vec![0usize; n];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
    for edge in hard {
        indegree[edge.to] += 1;
        outgoing[edge.from].push(edge.to);
    }
    let mut soft_preds: Vec<Vec<usize>> = vec![Vec::new(); n];
    for edge in soft {
        soft_preds[edge.to].push(edge.from);
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while !ready.is_empty() {
        let pick = ready
            .iter()
            .copied()
            .find(|&i| soft_preds[i].iter().all(|&p| placed[p] || p == i))
            .or_else(|| ready.first().copied());
        let Some(node) = pick else { break };
        ready.remove(&node);
        placed[node] = true;
        order.push(node);
        for &next in &outgoing[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(next);
            }
        }
    }
    if order.len() == n {
        Ok(order)
    } else {
        Err((0..n).filter(|&i| !placed[i]).collect())
    }
}

/// Walk predecessors among `remaining` until a node repeats.
fn find_cycle(remaining: &[usize], hard: &[&Edge]) -> Vec<usize> {
    let open: HashSet<usize> = remaining.iter().copied().collect();
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let mut path = Vec::new();
    let mut seen: HashMap<usize, usize> = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&at) = seen.get(&current) {
            let mut cycle: Vec<usize> = path[at..].to_vec();
            cycle.reverse();
            cycle.push(cycle[0]);
            return cycle;
        }
        seen.insert(current, path.len());
        path.push(current);
        match hard
            .iter()
            .find(|e| e.to == current && open.contains(&e.from))
        {
            Some(edge) => current = edge.from,
            None => return path,
        }
    }
}

fn describe(change_sets: &[ChangeSet], nodes: &[usize]) -> Vec<String> {
    nodes
        .iter()
        .map(|&i| format!("{:?}", change_sets[i].entity))
        .collect()
}

/// Sort `change_sets` along `edges`, returning the order and the soft edges
/// it violates.
#[allow(clippy::result_large_err)]
fn sort(change_sets: &[ChangeSet], edges: &[Edge], what: &str) -> Result<(Vec<usize>, Vec<Edge>)> {
    let n = change_sets.len();
    let all: Vec<&Edge> = edges.iter().collect();
    if let Ok(order) = kahn(n, &all, &[]) {
        return Ok((order, Vec::new()));
    }

    let (hard, soft): (Vec<&Edge>, Vec<&Edge>) = edges.iter().partition(|e| e.hard);
    match kahn(n, &hard, &soft) {
        Ok(order) => {
            let mut position = vec![0usize; n];
            for (pos, &node) in order.iter().enumerate() {
                position[node] = pos;
            }
            let violated: Vec<Edge> = soft
                .into_iter()
                .filter(|e| position[e.from] > position[e.to])
                .cloned()
                .collect();
            tracing::debug!(deferred = violated.len(), "Breaking {} cycle with deferred foreign keys", what);
            Ok((order, violated))
        }
        Err(remaining) => {
            let cycle = find_cycle(&remaining, &hard);
            Err(Error::Ordering(OrderingError {
                cycle: describe(change_sets, &cycle),
                message: format!(
                    "cannot order {}s: cycle of non-nullable foreign keys",
                    what
                ),
            }))
        }
    }
}

fn reorder(change_sets: Vec<ChangeSet>, order: &[usize]) -> Vec<ChangeSet> {
    let mut slots: Vec<Option<ChangeSet>> = change_sets.into_iter().map(Some).collect();
    order.iter().filter_map(|&i| slots[i].take()).collect()
}

/// Order creates so referenced rows are inserted first.
///
/// A reference to the same instance is deferred unless its key is assigned
/// up front, in which case the row can reference itself in one insert.
#[allow(clippy::result_large_err)]
pub fn sort_creates(creates: Vec<ChangeSet>) -> Result<(Vec<ChangeSet>, Vec<DeferredForeignKey>)> {
    let index: HashMap<EntityId, usize> = creates
        .iter()
        .enumerate()
        .map(|(i, cs)| (cs.entity.id(), i))
        .collect();

    let mut edges = Vec::new();
    let mut deferred = Vec::new();
    for (to, cs) in creates.iter().enumerate() {
        let meta = cs.entity.metadata();
        for (relation, target) in cs.referenced() {
            let Some(&from) = index.get(&target.id()) else {
                continue;
            };
            let nullable = meta.get_relation(relation).is_some_and(|r| r.nullable);
            if from == to {
                if cs.key.is_some() {
                    continue;
                }
                if !nullable {
                    return Err(Error::Ordering(OrderingError {
                        cycle: describe(&creates, &[to, to]),
                        message: format!(
                            "{}.{} is a non-nullable self-reference without a pre-assigned key",
                            meta.name, relation
                        ),
                    }));
                }
                deferred.push(DeferredForeignKey {
                    entity: cs.entity.clone(),
                    relation: relation.to_string(),
                    target: Some(cs.entity.clone()),
                });
                continue;
            }
            edges.push(Edge {
                from,
                to,
                hard: !nullable,
                holder: to,
                relation: relation.to_string(),
            });
        }
    }

    let (order, violated) = sort(&creates, &edges, "insert")?;
    for edge in violated {
        deferred.push(DeferredForeignKey {
            entity: creates[edge.holder].entity.clone(),
            relation: edge.relation,
            target: Some(creates[edge.from].entity.clone()),
        });
    }
    Ok((reorder(creates, &order), deferred))
}

/// Order deletes so referencing rows are deleted first.
///
/// Dependencies come from snapshots, since the row in the database still
/// holds the old foreign key.
#[allow(clippy::result_large_err)]
pub fn sort_deletes(
    registry: &MetadataRegistry,
    snapshots: &SnapshotStore,
    deletes: Vec<ChangeSet>,
) -> Result<(Vec<ChangeSet>, Vec<DeferredForeignKey>)> {
    let by_id: HashMap<EntityId, usize> = deletes
        .iter()
        .enumerate()
        .map(|(i, cs)| (cs.entity.id(), i))
        .collect();
    let by_key: HashMap<IdentityKey, usize> = deletes
        .iter()
        .enumerate()
        .filter_map(|(i, cs)| {
            cs.key
                .as_ref()
                .map(|k| (IdentityKey::for_type(cs.entity.metadata(), k), i))
        })
        .collect();

    let mut edges = Vec::new();
    for (holder, cs) in deletes.iter().enumerate() {
        let Some(snapshot) = snapshots.get(&cs.entity) else {
            continue;
        };
        for rel in cs.entity.metadata().owning_to_one() {
            let Some(Some(target)) = snapshot.reference(&rel.name) else {
                continue;
            };
            let by_instance = target.entity.and_then(|id| by_id.get(&id).copied());
            let by_target_key = || {
                let meta = registry.get(&rel.target)?;
                let key = target.key.as_ref()?;
                by_key.get(&IdentityKey::for_type(meta, key)).copied()
            };
            let Some(referenced) = by_instance.or_else(by_target_key) else {
                continue;
            };
            if referenced == holder {
                continue;
            }
            edges.push(Edge {
                from: holder,
                to: referenced,
                hard: !rel.nullable,
                holder,
                relation: rel.name.clone(),
            });
        }
    }

    let (order, violated) = sort(&deletes, &edges, "delete")?;
    let nullified = violated
        .into_iter()
        .map(|edge| DeferredForeignKey {
            entity: deletes[edge.holder].entity.clone(),
            relation: edge.relation,
            target: None,
        })
        .collect();
    Ok((reorder(deletes, &order), nullified))
}

/// Pivot statements for the collection deltas and deletes of one flush.
pub(crate) fn pivots(registry: &MetadataRegistry, plan: &mut FlushPlan) {
    let deleted: HashSet<EntityId> = plan.deletes.iter().map(|cs| cs.entity.id()).collect();
    for cs in plan.creates.iter().chain(&plan.updates) {
        let meta = cs.entity.metadata();
        for change in &cs.collection_changes {
            let Some(pivot) = meta
                .get_relation(&change.relation)
                .and_then(|r| r.pivot.as_ref())
            else {
                continue;
            };
            let link = |target: &Entity| PivotLink {
                table: pivot.table.clone(),
                owner_columns: pivot.owner_columns.clone(),
                target_columns: pivot.target_columns.clone(),
                owner: cs.entity.clone(),
                target: target.clone(),
            };
            plan.unlinks.extend(change.removed.iter().map(link));
            plan.links.extend(
                change
                    .added
                    .iter()
                    .filter(|t| !deleted.contains(&t.id()))
                    .map(link),
            );
        }
    }

    let mut seen = HashSet::new();
    for cs in &plan.deletes {
        let Some(key) = &cs.key else { continue };
        let meta = cs.entity.metadata();
        let owned = meta
            .relations
            .iter()
            .filter(|r| r.is_owning_many_to_many())
            .filter_map(|r| r.pivot.as_ref())
            .map(|p| (p.table.clone(), p.owner_columns.clone()));
        let referencing: Vec<(String, Vec<String>)> = registry
            .entities()
            .flat_map(|m| m.relations.iter())
            .filter(|r| r.is_owning_many_to_many() && registry.inherits_from(meta, &r.target))
            .filter_map(|r| r.pivot.as_ref())
            .map(|p| (p.table.clone(), p.target_columns.clone()))
            .collect();
        for (table, columns) in owned.chain(referencing) {
            if seen.insert((table.clone(), columns.join(","), key.serialize())) {
                plan.purges.push(PivotPurge {
                    table,
                    columns,
                    key: key.clone(),
                });
            }
        }
    }
}

/// Build the plan of one flush.
#[allow(clippy::result_large_err)]
#[tracing::instrument(level = "debug", skip_all, fields(creates = creates.len(), updates = updates.len(), deletes = deletes.len()))]
pub fn plan(
    registry: &MetadataRegistry,
    snapshots: &SnapshotStore,
    creates: Vec<ChangeSet>,
    updates: Vec<ChangeSet>,
    deletes: Vec<ChangeSet>,
) -> Result<FlushPlan> {
    let (creates, deferred) = sort_creates(creates)?;
    let (deletes, nullified) = sort_deletes(registry, snapshots, deletes)?;
    let mut plan = FlushPlan {
        creates,
        updates,
        deferred,
        nullified,
        deletes,
        ..FlushPlan::default()
    };
    pivots(registry, &mut plan);
    Ok(plan)
}
