//! Session and Unit of Work for entmodel.
//!
//! `entmodel-session` is the **unit-of-work layer**. A [`Session`] tracks the
//! entities an application loads or persists, computes what changed since
//! they were last known to the database, and writes those changes back in a
//! single ordered, transactional flush.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per primary key per session.
//! - **Snapshots**: the last persisted state, the baseline for diffing.
//! - **Change sets**: per-entity create/update/delete records of a flush.
//! - **Cascades**: related entities pulled into a flush by relation rules.
//! - **Ordering**: foreign-key aware statement order, with deferred keys for
//!   nullable cycles.
//! - **Hooks**: async lifecycle callbacks on entity types and sessions.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: nothing is written until `flush`.
//! - **All or nothing**: a failed flush rolls back and leaves the in-memory
//!   graph exactly as the caller left it.
//! - **Shared nothing**: sessions never share identity maps or snapshots;
//!   [`Session::fork`] starts an independent one over the same connection.
//! - **Cancel-correct**: All async operations use `Cx` + `Outcome` via `entmodel-core`.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(Arc::new(conn), Arc::new(registry));
//!
//! let author = Entity::new(registry.require("Author")?).with("name", "Ann")?;
//! session.persist(&author)?;
//! let result = session.flush(&cx).await?;
//! assert_eq!(result.inserted, 1);
//!
//! let same = session.find(&cx, "Author", author.primary_key().unwrap(), LockMode::None).await?;
//! ```

/// Unwrap an `Outcome`, returning early on anything but `Ok`.
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            ::entmodel_core::Outcome::Ok(value) => value,
            ::entmodel_core::Outcome::Err(e) => return ::entmodel_core::Outcome::Err(e),
            ::entmodel_core::Outcome::Cancelled(r) => return ::entmodel_core::Outcome::Cancelled(r),
            ::entmodel_core::Outcome::Panicked(p) => return ::entmodel_core::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return ::entmodel_core::Outcome::Err(e),
        }
    };
}

pub mod cascade;
pub mod change_set;
pub mod entity;
pub mod events;
pub mod flush;
pub mod identity_map;
mod loading;
pub mod ordering;
pub mod snapshot;

pub use cascade::{CascadeResolver, WorkingSet, merge_graph};
pub use change_set::{
    ChangeSet, ChangeSetKind, CollectionChange, compute_create, compute_delete, compute_update,
};
pub use entity::{Collection, CollectionStatus, Entity, EntityId, EntityState, Reference};
pub use events::{
    EntityHooks, EventArgs, EventType, Hook, HookFuture, MetadataHooks, SessionHooks, hook_fn,
};
pub use flush::{FlushResult, FlushState};
pub use identity_map::{IdentityKey, IdentityMap};
pub use ordering::{DeferredForeignKey, FlushPlan, PivotLink, PivotPurge};
pub use snapshot::{ChangeKind, EntitySnapshot, FieldChange, ReferenceSnapshot, SnapshotStore};

use entmodel_core::{
    Connection, Cx, EntityErrorKind, Error, IdentityConflictError, MetadataRegistry, Outcome,
    Result, TransactionError, TransactionErrorKind,
};
use events::Hooks;
use flush::{FlushExecutor, PendingWrite};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fail a flush that reaches new entities no cascade covers, instead of
    /// skipping them with a warning.
    pub strict_cascade: bool,
    /// Maximum rows per multi-row statement.
    pub batch_size: usize,
    /// Wrap a flush in its own transaction when no outer one is active.
    pub use_transactions: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            strict_cascade: false,
            batch_size: 300,
            use_transactions: true,
        }
    }
}

impl SessionConfig {
    pub fn strict_cascade(mut self, value: bool) -> Self {
        self.strict_cascade = value;
        self
    }

    pub fn batch_size(mut self, value: usize) -> Self {
        self.batch_size = value;
        self
    }

    pub fn use_transactions(mut self, value: bool) -> Self {
        self.use_transactions = value;
        self
    }
}

// ============================================================================
// Session State
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct TransactionState {
    depth: usize,
    rollback_only: bool,
}

/// Everything a session tracks, behind one lock.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) identity: IdentityMap,
    pub(crate) snapshots: SnapshotStore,
    /// Entities passed to `persist` since the last flush
    pub(crate) persist_stack: Vec<Entity>,
    /// Entities passed to `remove` since the last flush
    pub(crate) remove_stack: Vec<Entity>,
    last_change_sets: Vec<ChangeSet>,
    flush_state: FlushState,
    tx: TransactionState,
}

/// Resets the in-progress flag when a flush ends, however it ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// How a flush relates to the session's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxMode {
    /// The flush began its own transaction
    Owned,
    /// The flush runs inside an explicit outer transaction
    Joined,
    /// Transactions are disabled
    None,
}

/// Work computed under the state lock at the start of a flush.
struct Prepared {
    plan: FlushPlan,
    working: WorkingSet,
    baselines: HashMap<EntityId, EntitySnapshot>,
    persisted: Vec<Entity>,
    removed: Vec<Entity>,
    mode: TxMode,
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// Methods take `&self`: the session keeps its state behind a lock that is
/// never held across an `.await`, so a hook holding the session can call
/// back into it while a flush is suspended. Share it with `Arc` when hooks
/// need it.
pub struct Session<C: Connection> {
    id: u64,
    conn: Arc<C>,
    registry: Arc<MetadataRegistry>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    flushing: AtomicBool,
    hooks: Hooks,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("state", &self.debug_state())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a new session over a shared connection.
    pub fn new(conn: Arc<C>, registry: Arc<MetadataRegistry>) -> Self {
        Self::with_config(conn, registry, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(conn: Arc<C>, registry: Arc<MetadataRegistry>, config: SessionConfig) -> Self {
        Self::assemble(conn, registry, config, Hooks::default())
    }

    fn assemble(conn: Arc<C>, registry: Arc<MetadataRegistry>, config: SessionConfig, hooks: Hooks) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, "Session opened");
        Self {
            id,
            conn,
            registry,
            config,
            state: Mutex::new(SessionState::default()),
            flushing: AtomicBool::new(false),
            hooks,
        }
    }

    /// A new session over the same connection and metadata.
    ///
    /// The fork has its own identity map, snapshots and pending work, and
    /// may flush concurrently with this one. Entity hooks are shared; session
    /// hooks are not.
    pub fn fork(&self) -> Self {
        Self::assemble(
            Arc::clone(&self.conn),
            Arc::clone(&self.registry),
            self.config.clone(),
            self.hooks.fork(),
        )
    }

    /// Process-unique session id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &Arc<C> {
        &self.conn
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// Get the current configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_flush_state(&self, state: FlushState) {
        let mut guard = self.lock();
        if guard.flush_state != state {
            tracing::debug!(session = self.id, from = ?guard.flush_state, to = ?state, "Flush state");
            guard.flush_state = state;
        }
    }

    /// Where the current flush is, or `Idle`.
    pub fn flush_state(&self) -> FlushState {
        self.lock().flush_state
    }

    // ========================================================================
    // Hooks
    // ========================================================================

    /// Register a session-wide hook.
    pub fn on(&self, event: EventType, hook: Arc<dyn Hook>) {
        self.hooks
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(event, hook);
    }

    /// Register a hook for one entity type and its subtypes.
    ///
    /// Visible to this session and its forks only. Hooks every session should
    /// run belong on the metadata (see [`MetadataHooks`]); those run first.
    #[allow(clippy::result_large_err)]
    pub fn on_entity(&self, entity_type: &str, event: EventType, hook: Arc<dyn Hook>) -> Result<()> {
        let meta = self.registry.require(entity_type)?;
        self.hooks
            .entity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(meta.name.clone(), event, hook);
        Ok(())
    }

    // ========================================================================
    // Object Operations
    // ========================================================================

    #[allow(clippy::result_large_err)]
    fn check_owner(&self, entity: &Entity) -> Result<()> {
        let owner = entity.session_id();
        if owner != 0 && owner != self.id {
            return Err(Error::entity(
                EntityErrorKind::OtherSession,
                entity.entity_type(),
                format!("{:?} is managed by session {}", entity, owner),
            ));
        }
        self.registry.require(entity.entity_type())?;
        Ok(())
    }

    /// Schedule a new entity for insertion, or cancel a pending removal.
    ///
    /// An entity with a client-assigned key enters the identity map now;
    /// persisting a second instance under the same key fails here with
    /// `IdentityConflict`.
    #[allow(clippy::result_large_err)]
    pub fn persist(&self, entity: &Entity) -> Result<()> {
        self.check_owner(entity)?;
        let mut state = self.lock();
        state.remove_stack.retain(|e| !e.ptr_eq(entity));
        if let Some(pk) = entity.primary_key() {
            state
                .identity
                .attach(entity, IdentityKey::for_type(entity.metadata(), &pk))?;
        }
        if !state.persist_stack.iter().any(|e| e.ptr_eq(entity)) {
            state.persist_stack.push(entity.clone());
        }
        entity.bind_session(self.id);
        tracing::trace!(session = self.id, entity = ?entity, "Persist");
        Ok(())
    }

    /// Schedule an entity for deletion.
    ///
    /// Removing an entity that was persisted but never flushed cancels its
    /// insert.
    #[allow(clippy::result_large_err)]
    pub fn remove(&self, entity: &Entity) -> Result<()> {
        if entity.session_id() != self.id {
            return Err(Error::entity(
                EntityErrorKind::NotManaged,
                entity.entity_type(),
                format!("{:?} is not managed by this session", entity),
            ));
        }
        let mut state = self.lock();
        if !state.remove_stack.iter().any(|e| e.ptr_eq(entity)) {
            state.remove_stack.push(entity.clone());
        }
        tracing::trace!(session = self.id, entity = ?entity, "Remove");
        Ok(())
    }

    /// Stop tracking an entity. Pending work for it is dropped.
    pub fn detach(&self, entity: &Entity) {
        let mut state = self.lock();
        state.identity.remove_entity(entity);
        state.snapshots.remove(entity);
        state.persist_stack.retain(|e| !e.ptr_eq(entity));
        state.remove_stack.retain(|e| !e.ptr_eq(entity));
        if entity.session_id() == self.id {
            entity.bind_session(0);
        }
    }

    /// Detach everything.
    pub fn clear(&self) {
        let mut state = self.lock();
        Self::clear_state(self.id, &mut state);
    }

    fn clear_state(id: u64, state: &mut SessionState) {
        for entity in state
            .identity
            .entities()
            .chain(&state.persist_stack)
            .chain(&state.remove_stack)
        {
            if entity.session_id() == id {
                entity.bind_session(0);
            }
        }
        state.identity.clear();
        state.snapshots.clear();
        state.persist_stack.clear();
        state.remove_stack.clear();
        state.last_change_sets.clear();
    }

    /// Whether this session tracks `entity`.
    pub fn contains(&self, entity: &Entity) -> bool {
        let state = self.lock();
        state.identity.contains(entity) || state.persist_stack.iter().any(|e| e.ptr_eq(entity))
    }

    /// Lifecycle state of `entity` relative to this session.
    pub fn state_of(&self, entity: &Entity) -> EntityState {
        let state = self.lock();
        if entity.session_id() != self.id {
            EntityState::Detached
        } else if state.remove_stack.iter().any(|e| e.ptr_eq(entity)) {
            EntityState::Removed
        } else if state.snapshots.contains(entity) {
            EntityState::Managed
        } else if state.persist_stack.iter().any(|e| e.ptr_eq(entity))
            || state.identity.contains(entity)
        {
            EntityState::New
        } else {
            EntityState::Detached
        }
    }

    /// Identity map keys, rendered as `Type:key`.
    pub fn identity_keys(&self) -> Vec<String> {
        self.lock().identity.keys().collect()
    }

    /// Change sets executed by the last successful flush.
    pub fn change_sets(&self) -> Vec<ChangeSet> {
        self.lock().last_change_sets.clone()
    }

    // ========================================================================
    // Change Computation
    // ========================================================================

    #[allow(clippy::result_large_err)]
    fn compute(&self, state: &SessionState, working: &WorkingSet) -> Result<FlushPlan> {
        let mut creates = Vec::with_capacity(working.creates.len());
        for entity in &working.creates {
            self.registry.require(entity.entity_type())?;
            if let Some(pk) = entity.primary_key() {
                let key = IdentityKey::for_type(entity.metadata(), &pk);
                if state.identity.get(&key).is_some_and(|e| !e.ptr_eq(entity)) {
                    return Err(Error::IdentityConflict(IdentityConflictError {
                        entity: key.root().to_string(),
                        key: key.serialized_key().to_string(),
                    }));
                }
            }
            creates.push(compute_create(entity));
        }

        let mut updates = Vec::new();
        for entity in &working.updates {
            if let Some(snapshot) = state.snapshots.get(entity) {
                if let Some(change_set) = compute_update(entity, snapshot)? {
                    updates.push(change_set);
                }
            }
        }

        let deletes = working
            .deletes
            .iter()
            .filter_map(|e| state.snapshots.get(e).map(|s| compute_delete(e, s)))
            .collect();

        ordering::plan(&self.registry, &state.snapshots, creates, updates, deletes)
    }

    #[allow(clippy::result_large_err)]
    fn expand(&self, state: &SessionState) -> Result<WorkingSet> {
        CascadeResolver::new(&self.registry, &state.identity, &state.snapshots, self.id)
            .strict(self.config.strict_cascade)
            .expand(&state.persist_stack, &state.remove_stack)
    }

    /// Ordered change sets the next flush would execute, without executing.
    #[allow(clippy::result_large_err)]
    pub fn compute_change_sets(&self) -> Result<Vec<ChangeSet>> {
        let state = self.lock();
        let working = self.expand(&state)?;
        let plan = self.compute(&state, &working)?;
        Ok(plan.change_sets().cloned().collect())
    }

    #[allow(clippy::result_large_err)]
    fn prepare(&self) -> Result<Prepared> {
        let mut state = self.lock();
        state.flush_state = FlushState::Computing;
        let working = self.expand(&state)?;
        state.flush_state = FlushState::Sorting;
        let plan = self.compute(&state, &working)?;
        let baselines = plan
            .updates
            .iter()
            .filter_map(|cs| {
                state
                    .snapshots
                    .get(&cs.entity)
                    .map(|s| (cs.entity.id(), s.clone()))
            })
            .collect();
        let mode = if state.tx.depth > 0 {
            TxMode::Joined
        } else if self.config.use_transactions {
            TxMode::Owned
        } else {
            TxMode::None
        };
        Ok(Prepared {
            plan,
            working,
            baselines,
            persisted: state.persist_stack.clone(),
            removed: state.remove_stack.clone(),
            mode,
        })
    }

    // ========================================================================
    // Flush
    // ========================================================================

    /// Write every pending change to the database.
    ///
    /// Computes change sets, orders them by foreign-key dependencies and
    /// executes them inside a transaction (or the active outer one). On
    /// failure nothing in memory changes. Calling `flush` while a flush of
    /// this session is in flight, from a hook for instance, fails with
    /// `Error::ReentrantFlush`.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.id))]
    pub async fn flush(&self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            tracing::warn!(session = self.id, "Rejected re-entrant flush");
            return Outcome::Err(Error::ReentrantFlush);
        };
        let outcome = self.run_flush(cx).await;
        self.set_flush_state(FlushState::Idle);
        outcome
    }

    async fn run_flush(&self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let Prepared {
            mut plan,
            working,
            baselines,
            persisted,
            removed,
            mode,
        } = try_result!(self.prepare());

        if plan.is_empty() {
            self.finish(&plan, Vec::new(), &working, &persisted, &removed);
            tracing::debug!(session = self.id, "Nothing to flush");
            return Outcome::Ok(FlushResult::default());
        }

        self.set_flush_state(FlushState::Executing);
        if mode == TxMode::Owned {
            try_outcome!(self.conn.begin(cx).await);
        }

        let (result, writes) = match self.execute_plan(cx, &mut plan, baselines).await {
            Outcome::Ok(done) => done,
            Outcome::Err(e) => {
                self.abort(cx, mode, &e.to_string()).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.abort(cx, mode, "cancelled").await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.abort(cx, mode, "panicked").await;
                return Outcome::Panicked(p);
            }
        };

        if mode == TxMode::Owned {
            self.set_flush_state(FlushState::Committing);
            match self.conn.commit(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    self.abort(cx, mode, &e.to_string()).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.abort(cx, mode, "cancelled").await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.abort(cx, mode, "panicked").await;
                    return Outcome::Panicked(p);
                }
            }
        }

        let executed = self.finish(&plan, writes, &working, &persisted, &removed);
        tracing::info!(
            session = self.id,
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            statements = result.statements,
            "Flush complete"
        );

        // Committed: hook errors are reported but change nothing.
        for change_set in &executed {
            let args = EventArgs::entity(EventType::after(change_set.kind), change_set);
            try_result!(self.hooks.fire(cx, &self.registry, &args).await);
        }
        let args = EventArgs::flush(EventType::AfterFlush, &executed);
        try_result!(self.hooks.fire(cx, &self.registry, &args).await);

        Outcome::Ok(result)
    }

    async fn execute_plan(
        &self,
        cx: &Cx,
        plan: &mut FlushPlan,
        baselines: HashMap<EntityId, EntitySnapshot>,
    ) -> Outcome<(FlushResult, Vec<PendingWrite>), Error> {
        let change_sets: Vec<ChangeSet> = plan.change_sets().cloned().collect();
        let args = EventArgs::flush(EventType::BeforeFlush, &change_sets);
        try_result!(self.hooks.fire(cx, &self.registry, &args).await);

        let mut executor = FlushExecutor::new(
            self.conn.as_ref(),
            &self.registry,
            &self.hooks,
            self.config.batch_size,
            baselines,
        );
        try_outcome!(executor.execute(cx, plan).await);
        Outcome::Ok((executor.result(), executor.into_writes()))
    }

    /// Undo a failed flush at the transaction level.
    async fn abort(&self, cx: &Cx, mode: TxMode, reason: &str) {
        match mode {
            TxMode::Owned => {
                self.set_flush_state(FlushState::RollingBack);
                match self.conn.rollback(cx).await {
                    Outcome::Ok(()) => {
                        tracing::warn!(session = self.id, reason, "Flush rolled back");
                    }
                    Outcome::Err(e) => {
                        tracing::warn!(session = self.id, reason, error = %e, "Rollback after failed flush failed");
                    }
                    Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                        tracing::warn!(session = self.id, reason, "Rollback after failed flush did not complete");
                    }
                }
            }
            TxMode::Joined => {
                self.lock().tx.rollback_only = true;
                tracing::warn!(
                    session = self.id,
                    reason,
                    "Flush failed inside an outer transaction; marked rollback-only"
                );
            }
            TxMode::None => {
                tracing::warn!(session = self.id, reason, "Flush failed without a transaction");
            }
        }
    }

    /// Apply a committed flush to in-memory state. Returns the executed change sets.
    fn finish(
        &self,
        plan: &FlushPlan,
        writes: Vec<PendingWrite>,
        working: &WorkingSet,
        persisted: &[Entity],
        removed: &[Entity],
    ) -> Vec<ChangeSet> {
        for write in writes {
            write.entity.write().values.insert(write.property, write.value);
        }

        let mut state = self.lock();
        for change_set in &plan.creates {
            let entity = &change_set.entity;
            if let Some(pk) = entity.primary_key() {
                let key = IdentityKey::for_type(entity.metadata(), &pk);
                state.identity.register(entity.clone(), key);
            }
            entity.bind_session(self.id);
        }
        for change_set in &plan.deletes {
            let entity = &change_set.entity;
            state.identity.remove_entity(entity);
            state.snapshots.remove(entity);
            entity.clear_collection_deltas();
            entity.bind_session(0);
        }
        for entity in &working.collapsed {
            state.identity.remove_entity(entity);
            entity.clear_collection_deltas();
            entity.bind_session(0);
        }
        for entity in state.identity.entities() {
            entity.clear_collection_deltas();
        }
        for change_set in plan.creates.iter().chain(&plan.updates) {
            state.snapshots.capture(&change_set.entity);
        }

        state.persist_stack.retain(|e| !persisted.iter().any(|p| p.ptr_eq(e)));
        state.remove_stack.retain(|e| !removed.iter().any(|r| r.ptr_eq(e)));
        let executed: Vec<ChangeSet> = plan.change_sets().cloned().collect();
        state.last_change_sets = executed.clone();
        executed
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin an explicit transaction, or enter a nested level of the active one.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.id))]
    pub async fn begin(&self, cx: &Cx) -> Outcome<(), Error> {
        let depth = self.lock().tx.depth;
        if depth == 0 {
            try_outcome!(self.conn.begin(cx).await);
        }
        let mut state = self.lock();
        state.tx.depth += 1;
        tracing::debug!(session = self.id, depth = state.tx.depth, "Transaction begun");
        Outcome::Ok(())
    }

    /// Leave one transaction level, committing at the outermost.
    ///
    /// The outermost commit flushes pending changes first. A transaction
    /// marked rollback-only by a failed inner flush is rolled back instead
    /// and `TransactionErrorKind::RollbackOnly` is returned.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.id))]
    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        let tx = self.lock().tx;
        match tx.depth {
            0 => Outcome::Err(not_active("commit")),
            1 => {
                if !tx.rollback_only {
                    try_outcome!(self.flush(cx).await);
                }
                if self.lock().tx.rollback_only {
                    try_outcome!(self.rollback(cx).await);
                    return Outcome::Err(Error::Transaction(TransactionError {
                        kind: TransactionErrorKind::RollbackOnly,
                        message: "transaction was marked rollback-only by a failed flush".to_string(),
                    }));
                }
                try_outcome!(self.conn.commit(cx).await);
                self.lock().tx = TransactionState::default();
                tracing::debug!(session = self.id, "Transaction committed");
                Outcome::Ok(())
            }
            _ => {
                self.lock().tx.depth -= 1;
                Outcome::Ok(())
            }
        }
    }

    /// Leave one transaction level, rolling back at the outermost.
    ///
    /// An inner rollback marks the whole transaction rollback-only. The
    /// outermost rollback discards the database work and clears the session,
    /// since no snapshot can be trusted afterwards.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.id))]
    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        let tx = self.lock().tx;
        match tx.depth {
            0 => Outcome::Err(not_active("rollback")),
            1 => {
                let outcome = self.conn.rollback(cx).await;
                let mut state = self.lock();
                state.tx = TransactionState::default();
                Self::clear_state(self.id, &mut state);
                tracing::debug!(session = self.id, "Transaction rolled back; session cleared");
                outcome
            }
            _ => {
                let mut state = self.lock();
                state.tx.depth -= 1;
                state.tx.rollback_only = true;
                Outcome::Ok(())
            }
        }
    }

    /// Whether an explicit transaction is active.
    pub fn in_transaction(&self) -> bool {
        self.lock().tx.depth > 0
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let state = self.lock();
        SessionDebugInfo {
            managed: state.identity.len(),
            snapshots: state.snapshots.len(),
            pending_persist: state.persist_stack.len(),
            pending_remove: state.remove_stack.len(),
            transaction_depth: state.tx.depth,
            rollback_only: state.tx.rollback_only,
        }
    }
}

fn not_active(operation: &str) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: format!("{} without an active transaction", operation),
    })
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDebugInfo {
    /// Instances in the identity map
    pub managed: usize,
    /// Captured snapshots
    pub snapshots: usize,
    /// Entities awaiting insert
    pub pending_persist: usize,
    /// Entities awaiting delete
    pub pending_remove: usize,
    /// Explicit transaction nesting depth
    pub transaction_depth: usize,
    /// Whether the outer transaction can only roll back
    pub rollback_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use entmodel_core::{LockMode, PrimaryKey, PropertyMetadata, PropertyType, Value};
    use entmodel_memory::MemoryConnection;
    use std::sync::Weak;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn registry() -> Arc<MetadataRegistry> {
        let registry = MetadataRegistry::builder()
            .entity(
                entmodel_core::EntityMetadata::new("Author")
                    .property(
                        PropertyMetadata::new("id", PropertyType::BigInt)
                            .primary_key(true)
                            .auto_increment(true),
                    )
                    .property(PropertyMetadata::new("name", PropertyType::Text)),
            )
            .build()
            .unwrap();
        Arc::new(registry)
    }

    fn session() -> (Arc<MemoryConnection>, Session<MemoryConnection>) {
        let registry = registry();
        let conn = Arc::new(MemoryConnection::from_registry(&registry));
        (Arc::clone(&conn), Session::new(conn, registry))
    }

    fn author(session: &Session<MemoryConnection>, name: &str) -> Entity {
        Entity::new(session.registry().require("Author").unwrap())
            .with("name", name)
            .unwrap()
    }

    fn run<F: std::future::Future>(f: F) -> F::Output {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(f)
    }

    /// Calls `flush` on the session it belongs to and records the outcome.
    struct FlushFromHook {
        session: Mutex<Weak<Session<MemoryConnection>>>,
        rejected: Mutex<Option<bool>>,
    }

    impl Hook for FlushFromHook {
        fn call<'a>(&'a self, cx: &'a Cx, _args: &'a EventArgs) -> HookFuture<'a> {
            Box::pin(async move {
                let session = self.session.lock().unwrap().upgrade();
                if let Some(session) = session {
                    let outcome = session.flush(cx).await;
                    let rejected = matches!(outcome, Outcome::Err(Error::ReentrantFlush));
                    *self.rejected.lock().unwrap() = Some(rejected);
                }
                Ok(())
            })
        }
    }

    #[test]
    fn flush_from_a_hook_is_rejected_as_reentrant() {
        let cx = Cx::for_testing();
        run(async {
            let (conn, session) = session();
            let session = Arc::new(session);
            let hook = Arc::new(FlushFromHook {
                session: Mutex::new(Arc::downgrade(&session)),
                rejected: Mutex::new(None),
            });
            session.on(EventType::BeforeFlush, Arc::clone(&hook) as Arc<dyn Hook>);

            session.persist(&author(&session, "Ann")).unwrap();
            let result = unwrap_outcome(session.flush(&cx).await);

            assert_eq!(result.inserted, 1);
            assert_eq!(*hook.rejected.lock().unwrap(), Some(true));
            assert_eq!(conn.rows("author").len(), 1);
            assert_eq!(session.flush_state(), FlushState::Idle);
        });
    }

    #[test]
    fn forks_keep_separate_identity_maps() {
        let cx = Cx::for_testing();
        run(async {
            let (_conn, session) = session();
            let ann = author(&session, "Ann");
            session.persist(&ann).unwrap();
            unwrap_outcome(session.flush(&cx).await);
            let key = ann.primary_key().unwrap();

            let fork = session.fork();
            assert_ne!(fork.id(), session.id());
            assert!(!fork.contains(&ann));

            let loaded = unwrap_outcome(fork.find(&cx, "Author", key.clone(), LockMode::None).await)
                .unwrap();
            assert!(!loaded.ptr_eq(&ann));
            assert_eq!(loaded.get("name"), Some(Value::from("Ann")));

            // Changes in the fork stay invisible to the parent until read back.
            loaded.set("name", "Anne").unwrap();
            unwrap_outcome(fork.flush(&cx).await);
            assert_eq!(ann.get("name"), Some(Value::from("Ann")));
            let same = unwrap_outcome(session.find(&cx, "Author", key, LockMode::None).await)
                .unwrap();
            assert!(same.ptr_eq(&ann));
        });
    }

    #[test]
    fn session_hooks_are_not_inherited_by_forks() {
        let cx = Cx::for_testing();
        run(async {
            let (_conn, session) = session();
            let calls = Arc::new(Mutex::new(0));
            let counter = Arc::clone(&calls);
            session.on(
                EventType::AfterFlush,
                hook_fn(move |_| {
                    *counter.lock().unwrap() += 1;
                    Ok(())
                }),
            );
            let fork = session.fork();
            fork.persist(&author(&fork, "Ann")).unwrap();
            unwrap_outcome(fork.flush(&cx).await);
            assert_eq!(*calls.lock().unwrap(), 0);
        });
    }

    #[test]
    fn commit_flushes_pending_work() {
        let cx = Cx::for_testing();
        run(async {
            let (conn, session) = session();
            unwrap_outcome(session.begin(&cx).await);
            assert!(session.in_transaction());
            session.persist(&author(&session, "Ann")).unwrap();
            unwrap_outcome(session.commit(&cx).await);

            assert!(!session.in_transaction());
            assert!(!conn.in_transaction());
            assert_eq!(conn.rows("author").len(), 1);
        });
    }

    #[test]
    fn inner_rollback_makes_outer_commit_fail() {
        let cx = Cx::for_testing();
        run(async {
            let (conn, session) = session();
            unwrap_outcome(session.begin(&cx).await);
            unwrap_outcome(session.begin(&cx).await);
            session.persist(&author(&session, "Ann")).unwrap();
            unwrap_outcome(session.flush(&cx).await);
            unwrap_outcome(session.rollback(&cx).await);
            assert!(session.debug_state().rollback_only);

            match session.commit(&cx).await {
                Outcome::Err(Error::Transaction(e)) => {
                    assert_eq!(e.kind, TransactionErrorKind::RollbackOnly);
                }
                other => panic!("expected rollback-only error, got {other:?}"),
            }
            assert!(!conn.in_transaction());
            assert!(conn.rows("author").is_empty());
            assert_eq!(session.debug_state().managed, 0);
        });
    }

    #[test]
    fn outer_rollback_discards_rows_and_clears_the_session() {
        let cx = Cx::for_testing();
        run(async {
            let (conn, session) = session();
            unwrap_outcome(session.begin(&cx).await);
            let ann = author(&session, "Ann");
            session.persist(&ann).unwrap();
            unwrap_outcome(session.flush(&cx).await);
            assert_eq!(conn.rows("author").len(), 1);
            assert!(session.contains(&ann));

            unwrap_outcome(session.rollback(&cx).await);
            assert!(conn.rows("author").is_empty());
            assert!(!session.contains(&ann));
            assert_eq!(session.state_of(&ann), EntityState::Detached);
        });
    }

    #[test]
    fn commit_and_rollback_need_an_active_transaction() {
        let cx = Cx::for_testing();
        run(async {
            let (_conn, session) = session();
            for outcome in [session.commit(&cx).await, session.rollback(&cx).await] {
                match outcome {
                    Outcome::Err(Error::Transaction(e)) => {
                        assert_eq!(e.kind, TransactionErrorKind::NotActive);
                    }
                    other => panic!("expected not-active error, got {other:?}"),
                }
            }
        });
    }

    #[test]
    fn flush_without_transactions_sends_no_begin() {
        let cx = Cx::for_testing();
        run(async {
            let registry = registry();
            let conn = Arc::new(MemoryConnection::from_registry(&registry));
            let session = Session::with_config(
                Arc::clone(&conn),
                registry,
                SessionConfig::default().use_transactions(false),
            );
            session.persist(&author(&session, "Ann")).unwrap();
            unwrap_outcome(session.flush(&cx).await);
            assert!(!conn.in_transaction());
            assert_eq!(conn.statements().len(), 1);
        });
    }

    #[test]
    fn debug_state_counts_pending_work() {
        let (_conn, session) = session();
        let ann = author(&session, "Ann");
        session.persist(&ann).unwrap();
        let info = session.debug_state();
        assert_eq!(info.pending_persist, 1);
        assert_eq!(info.managed, 0);
        assert_eq!(info.transaction_depth, 0);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["pending_persist"], 1);

        session.clear();
        assert_eq!(session.debug_state().pending_persist, 0);
        assert_eq!(session.state_of(&ann), EntityState::Detached);
    }

    #[test]
    fn find_rejects_keys_of_the_wrong_arity() {
        let cx = Cx::for_testing();
        run(async {
            let (_conn, session) = session();
            let key = PrimaryKey::new(vec![Value::BigInt(1), Value::BigInt(2)]);
            let outcome = session.find(&cx, "Author", key, LockMode::None).await;
            match outcome {
                Outcome::Err(e) => assert_eq!(e.entity_kind(), Some(EntityErrorKind::KeyArity)),
                other => panic!("expected an error, got {other:?}"),
            }
        });
    }
}
