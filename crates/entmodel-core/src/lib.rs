//! Core types and traits for entmodel.
//!
//! This crate provides the foundations the unit of work is built on:
//!
//! - `Value` and `PrimaryKey` for dynamically typed entity state
//! - `EntityMetadata` and the `MetadataRegistry` resolution pass
//! - `Connection` trait and structured `Statement`s for drivers
//! - `Error` taxonomy shared by every crate in the workspace
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod metadata;
pub mod row;
pub mod types;
pub mod value;

pub use connection::{
    Capabilities, Condition, Connection, DeleteRow, DeleteStatement, FindRequest, InsertStatement,
    LockMode, QueryResult, Statement, UpdateRow, UpdateStatement, VersionCheck, quote_ident,
    values_match,
};
pub use error::{
    CascadeError, ConnectionError, ConnectionErrorKind, ConstraintError, ConstraintKind,
    EntityError, EntityErrorKind, Error, HookError, IdentityConflictError, MetadataError,
    MetadataErrorKind, OptimisticLockError, OrderingError, QueryError, QueryErrorKind, Result,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use metadata::{
    Cascade, EntityMetadata, MetadataHook, MetadataRegistry, PivotTable, PropertyMetadata,
    RegistryBuilder, RelationKind, RelationMetadata,
};
pub use row::{FromValue, Row};
pub use types::{CustomType, PropertyType};
pub use value::{PrimaryKey, Value};
