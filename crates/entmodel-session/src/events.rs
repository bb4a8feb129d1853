//! Lifecycle events and hooks.
//!
//! Hooks are declared on entity metadata, registered on a session for an
//! entity type, or registered on a session globally. They run sequentially
//! in that order, each group in registration order with ancestor types
//! first. Entity events receive the change set of the row being written;
//! flush events receive the complete ordered list.
//!
//! Hooks are async-capable so they can perform I/O. A hook that needs only
//! the event payload can be written as a closure with [`hook_fn`].
//!
//! ```ignore
//! let book = EntityMetadata::new("Book")
//!     .hook(EventType::BeforeCreate, hook_fn(|args| Ok(())));
//!
//! session.on(EventType::BeforeFlush, hook_fn(|args| {
//!     tracing::info!(count = args.change_sets.len(), "flushing");
//!     Ok(())
//! }));
//! ```

use crate::change_set::{ChangeSet, ChangeSetKind};
use entmodel_core::{
    Cx, EntityMetadata, Error, HookError, MetadataHook, MetadataRegistry, Result,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

/// Points in the flush lifecycle a hook can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    BeforeFlush,
    AfterFlush,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::BeforeCreate => "before_create",
            EventType::AfterCreate => "after_create",
            EventType::BeforeUpdate => "before_update",
            EventType::AfterUpdate => "after_update",
            EventType::BeforeDelete => "before_delete",
            EventType::AfterDelete => "after_delete",
            EventType::BeforeFlush => "before_flush",
            EventType::AfterFlush => "after_flush",
        }
    }

    /// Whether the event concerns a single entity.
    pub const fn is_entity_event(self) -> bool {
        !matches!(self, EventType::BeforeFlush | EventType::AfterFlush)
    }

    /// Event fired before a change set's statement is built.
    pub const fn before(kind: ChangeSetKind) -> Self {
        match kind {
            ChangeSetKind::Create => EventType::BeforeCreate,
            ChangeSetKind::Update => EventType::BeforeUpdate,
            ChangeSetKind::Delete => EventType::BeforeDelete,
        }
    }

    /// Event fired once a change set is committed.
    pub const fn after(kind: ChangeSetKind) -> Self {
        match kind {
            ChangeSetKind::Create => EventType::AfterCreate,
            ChangeSetKind::Update => EventType::AfterUpdate,
            ChangeSetKind::Delete => EventType::AfterDelete,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload handed to hooks.
#[derive(Debug, Clone)]
pub struct EventArgs {
    pub event: EventType,
    /// The row being written, for entity events
    pub change_set: Option<ChangeSet>,
    /// Every change set of the flush in execution order, for flush events
    pub change_sets: Vec<ChangeSet>,
}

impl EventArgs {
    pub(crate) fn entity(event: EventType, change_set: &ChangeSet) -> Self {
        Self {
            event,
            change_set: Some(change_set.clone()),
            change_sets: Vec::new(),
        }
    }

    pub(crate) fn flush(event: EventType, change_sets: &[ChangeSet]) -> Self {
        Self {
            event,
            change_set: None,
            change_sets: change_sets.to_vec(),
        }
    }

    /// Entity the event concerns.
    pub fn entity_ref(&self) -> Option<&crate::Entity> {
        self.change_set.as_ref().map(|cs| &cs.entity)
    }
}

/// Future returned by a hook.
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A lifecycle hook.
pub trait Hook: Send + Sync {
    fn call<'a>(&'a self, cx: &'a Cx, args: &'a EventArgs) -> HookFuture<'a>;
}

struct FnHook<F>(F);

impl<F> Hook for FnHook<F>
where
    F: Fn(&EventArgs) -> Result<()> + Send + Sync,
{
    fn call<'a>(&'a self, _cx: &'a Cx, args: &'a EventArgs) -> HookFuture<'a> {
        let result = (self.0)(args);
        Box::pin(async move { result })
    }
}

/// Wrap a synchronous closure as a hook.
pub fn hook_fn<F>(f: F) -> Arc<dyn Hook>
where
    F: Fn(&EventArgs) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHook(f))
}

/// Declares lifecycle hooks on entity metadata.
///
/// Hooks declared this way live in the resolved registry, so every session
/// built over it sees them.
pub trait MetadataHooks {
    #[must_use]
    fn hook(self, event: EventType, hook: Arc<dyn Hook>) -> Self;
}

impl MetadataHooks for EntityMetadata {
    fn hook(self, event: EventType, hook: Arc<dyn Hook>) -> Self {
        self.with_hook(MetadataHook::new(event.as_str(), Arc::new(hook)))
    }
}

/// `meta` and its ancestors, root first.
fn lineage<'a>(registry: &'a MetadataRegistry, meta: &'a EntityMetadata) -> Vec<&'a EntityMetadata> {
    let mut chain = Vec::new();
    let mut current = Some(meta);
    while let Some(m) = current {
        chain.push(m);
        if chain.len() > registry.len() {
            break;
        }
        current = m
            .extends
            .as_deref()
            .and_then(|parent| registry.get(parent))
            .map(Arc::as_ref);
    }
    chain.reverse();
    chain
}

/// Hooks for `event` declared on `meta` and its ancestors.
fn declared(
    registry: &MetadataRegistry,
    meta: &EntityMetadata,
    event: EventType,
) -> Vec<Arc<dyn Hook>> {
    lineage(registry, meta)
        .into_iter()
        .flat_map(|m| m.hooks_for(event.as_str()))
        .filter_map(|h| h.downcast_ref::<Arc<dyn Hook>>().cloned())
        .collect()
}

type Registration = (EventType, Arc<dyn Hook>);

/// Entity-scoped hook registrations made on a session, keyed by entity type
/// name.
///
/// Shared between a session and its forks, since they describe entity types
/// rather than session state.
#[derive(Default)]
pub struct EntityHooks {
    by_entity: HashMap<String, Vec<Registration>>,
}

impl EntityHooks {
    pub fn register(&mut self, entity: impl Into<String>, event: EventType, hook: Arc<dyn Hook>) {
        self.by_entity
            .entry(entity.into())
            .or_default()
            .push((event, hook));
    }

    /// Hooks for `event` on `meta`, ancestors' hooks first.
    pub(crate) fn matching(
        &self,
        registry: &MetadataRegistry,
        meta: &EntityMetadata,
        event: EventType,
    ) -> Vec<Arc<dyn Hook>> {
        lineage(registry, meta)
            .into_iter()
            .filter_map(|m| self.by_entity.get(&m.name))
            .flatten()
            .filter(|(e, _)| *e == event)
            .map(|(_, hook)| Arc::clone(hook))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_entity.values().all(Vec::is_empty)
    }
}

impl fmt::Debug for EntityHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.by_entity.iter().map(|(k, v)| (k, v.len())))
            .finish()
    }
}

/// Session-wide hook registrations.
#[derive(Default)]
pub struct SessionHooks {
    hooks: Vec<Registration>,
}

impl SessionHooks {
    pub fn register(&mut self, event: EventType, hook: Arc<dyn Hook>) {
        self.hooks.push((event, hook));
    }

    pub(crate) fn matching(&self, event: EventType) -> impl Iterator<Item = Arc<dyn Hook>> + '_ {
        self.hooks
            .iter()
            .filter(move |(e, _)| *e == event)
            .map(|(_, hook)| Arc::clone(hook))
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHooks")
            .field("count", &self.hooks.len())
            .finish()
    }
}

/// Hook registrations visible to one session.
#[derive(Debug, Default)]
pub(crate) struct Hooks {
    pub(crate) entity: Arc<RwLock<EntityHooks>>,
    pub(crate) session: RwLock<SessionHooks>,
}

impl Hooks {
    /// Registrations for a forked session: entity hooks are shared.
    pub(crate) fn fork(&self) -> Self {
        Self {
            entity: Arc::clone(&self.entity),
            session: RwLock::default(),
        }
    }

    pub(crate) fn collect(
        &self,
        registry: &MetadataRegistry,
        event: EventType,
        meta: Option<&EntityMetadata>,
    ) -> Vec<Arc<dyn Hook>> {
        let mut hooks = Vec::new();
        if let Some(meta) = meta {
            hooks.extend(declared(registry, meta, event));
            hooks.extend(
                self.entity
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .matching(registry, meta, event),
            );
        }
        hooks.extend(
            self.session
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .matching(event),
        );
        hooks
    }

    /// Run every hook registered for `args.event`.
    #[allow(clippy::result_large_err)]
    pub(crate) async fn fire(
        &self,
        cx: &Cx,
        registry: &MetadataRegistry,
        args: &EventArgs,
    ) -> Result<()> {
        let meta = args.entity_ref().map(|e| Arc::clone(e.metadata()));
        let hooks = self.collect(registry, args.event, meta.as_deref());
        dispatch(cx, hooks, args).await
    }
}

/// Attach the event and entity to a hook failure.
fn hook_error(event: EventType, entity: Option<&str>, error: Error) -> Error {
    match error {
        Error::Hook(mut e) => {
            if e.entity.is_none() {
                e.entity = entity.map(str::to_string);
            }
            Error::Hook(e)
        }
        // Flow-control errors pass through untouched.
        Error::ReentrantFlush | Error::Cancelled => error,
        other => Error::Hook(HookError {
            event: event.as_str().to_string(),
            entity: entity.map(str::to_string),
            message: other.to_string(),
            source: Some(Box::new(other)),
        }),
    }
}

/// Run `hooks` one after another, stopping at the first failure.
#[allow(clippy::result_large_err)]
pub(crate) async fn dispatch(cx: &Cx, hooks: Vec<Arc<dyn Hook>>, args: &EventArgs) -> Result<()> {
    if hooks.is_empty() {
        return Ok(());
    }
    let entity = args.entity_ref().map(|e| e.entity_type().to_string());
    tracing::trace!(event = %args.event, count = hooks.len(), "Dispatching hooks");
    for hook in hooks {
        if let Err(e) = hook.call(cx, args).await {
            tracing::debug!(event = %args.event, error = %e, "Hook failed");
            return Err(hook_error(args.event, entity.as_deref(), e));
        }
    }
    Ok(())
}
