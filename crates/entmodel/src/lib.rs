//! entmodel - Unit of Work entity persistence for Rust.
//!
//! entmodel tracks the entities an application reads and writes, works out
//! what changed, and writes the difference back in one ordered transaction:
//!
//! - An identity map guaranteeing one instance per row per session
//! - Snapshot-based change detection with pluggable value comparison
//! - Cascading persist, remove and merge along declared relations
//! - Foreign-key aware statement ordering, with deferred keys for cycles
//! - Optimistic locking through version properties
//! - Async lifecycle hooks on entity types and sessions
//!
//! # Quick Start
//!
//! ```ignore
//! use entmodel::prelude::*;
//!
//! let registry = MetadataRegistry::builder()
//!     .entity(
//!         EntityMetadata::new("Author")
//!             .property(PropertyMetadata::new("id", PropertyType::BigInt).primary_key(true).auto_increment(true))
//!             .property(PropertyMetadata::new("name", PropertyType::Text)),
//!     )
//!     .build()?;
//! let registry = Arc::new(registry);
//! let session = Session::new(Arc::new(conn), Arc::clone(&registry));
//!
//! let author = Entity::new(registry.require("Author")?).with("name", "Ann")?;
//! session.persist(&author)?;
//! session.flush(&cx).await?;
//!
//! author.set("name", "Anne")?;
//! session.flush(&cx).await?; // one UPDATE of `name`
//! ```
//!
//! # Drivers
//!
//! Anything implementing [`Connection`] can back a session. The `memory`
//! feature adds an in-memory relational driver that enforces keys and
//! foreign keys, useful for tests.

pub use entmodel_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Driver interface
    Capabilities,
    Condition,
    Connection,
    DeleteRow,
    DeleteStatement,
    FindRequest,
    InsertStatement,
    LockMode,
    QueryResult,
    Statement,
    UpdateRow,
    UpdateStatement,
    VersionCheck,
    // Metadata
    Cascade,
    CustomType,
    EntityMetadata,
    MetadataHook,
    MetadataRegistry,
    PivotTable,
    PropertyMetadata,
    PropertyType,
    RegistryBuilder,
    RelationKind,
    RelationMetadata,
    // Values and errors
    Error,
    PrimaryKey,
    Result,
    Row,
    Value,
};

pub use entmodel_core::error;

pub use entmodel_session::{
    ChangeKind, ChangeSet, ChangeSetKind, Collection, CollectionChange, CollectionStatus, Entity,
    EntityId, EntityState, EventArgs, EventType, FieldChange, FlushResult, FlushState, Hook,
    HookFuture, IdentityKey, MetadataHooks, Reference, Session, SessionConfig, SessionDebugInfo,
    hook_fn,
};

#[cfg(feature = "memory")]
pub use entmodel_memory::{MemoryConnection, MemoryOptions};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use entmodel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Cascade, Condition, Connection, Cx, Entity, EntityMetadata, EntityState, Error,
        EventType, FlushResult, LockMode, MetadataHooks, MetadataRegistry, Outcome, PrimaryKey,
        PropertyMetadata, PropertyType, RelationMetadata, Result, Session, SessionConfig, Value,
        hook_fn,
    };
    pub use std::sync::Arc;
}
