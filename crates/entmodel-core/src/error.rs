//! Error types for entmodel operations.

use std::fmt;

/// The primary error type for all entmodel operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout)
    Connection(ConnectionError),
    /// Query execution errors reported by a driver
    Query(QueryError),
    /// Foreign-key, unique, not-null or check violation
    Constraint(ConstraintError),
    /// A version-checked (or expected) update/delete matched no row
    OptimisticLock(OptimisticLockError),
    /// Two distinct instances claimed the same identity key
    IdentityConflict(IdentityConflictError),
    /// The flush dependency graph has a cycle that cannot be deferred
    Ordering(OrderingError),
    /// A flush was requested while another flush on the same session runs
    ReentrantFlush,
    /// Entity metadata is invalid or unresolved
    Metadata(MetadataError),
    /// A reachable new entity was not cascaded (strict cascade mode)
    Cascade(CascadeError),
    /// An entity cannot take part in the requested operation
    Entity(EntityError),
    /// A lifecycle hook failed
    Hook(HookError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// Type conversion errors
    Type(TypeError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
    /// Operation timed out at the driver
    Timeout,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in the statement
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConstraintError {
    pub kind: ConstraintKind,
    pub table: Option<String>,
    pub constraint: Option<String>,
    pub message: String,
    pub sqlstate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Referenced row missing, or row still referenced
    ForeignKey,
    /// Duplicate key
    Unique,
    /// NULL written to a NOT NULL column
    NotNull,
    /// CHECK constraint failed
    Check,
}

#[derive(Debug)]
pub struct OptimisticLockError {
    /// Entity type name
    pub entity: String,
    /// Rendered primary key
    pub key: String,
    /// Version the session expected to find, if the entity is versioned
    pub expected_version: Option<crate::Value>,
    /// Rows the statement was expected to touch
    pub expected_rows: u64,
    /// Rows it actually touched
    pub affected_rows: u64,
}

#[derive(Debug)]
pub struct IdentityConflictError {
    /// Root entity type name
    pub entity: String,
    /// Rendered primary key
    pub key: String,
}

#[derive(Debug)]
pub struct OrderingError {
    /// Entity descriptions along the cycle, first element repeated at the end
    pub cycle: Vec<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct MetadataError {
    pub kind: MetadataErrorKind,
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataErrorKind {
    /// Relation target or inverse side could not be found
    UnresolvedRelation,
    /// Entity name is not registered
    UnknownEntity,
    /// Property or relation name is not declared
    UnknownProperty,
    /// Table, column or property name is not a valid identifier
    InvalidIdentifier,
    /// Entity declares no primary key
    MissingPrimaryKey,
    /// Two declarations collide
    Duplicate,
    /// Inheritance declaration is inconsistent
    Inheritance,
}

#[derive(Debug)]
pub struct EntityError {
    pub kind: EntityErrorKind,
    /// Entity type name
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityErrorKind {
    /// The entity is not managed by this session
    NotManaged,
    /// The entity is managed by another session
    OtherSession,
    /// A primary-key property of a managed entity changed
    KeyChanged,
    /// A key has the wrong number of values for the entity type
    KeyArity,
    /// The entity (or its row) has no primary key where one is required
    MissingKey,
    /// The entity's row is gone from the database
    RowNotFound,
}

#[derive(Debug)]
pub struct CascadeError {
    /// Entity holding the reference
    pub entity: String,
    /// Relation the un-persisted entity was reached through
    pub relation: String,
    /// Type of the un-persisted entity
    pub target: String,
}

#[derive(Debug)]
pub struct HookError {
    /// Event the hook was registered for
    pub event: String,
    /// Entity type the event concerned, absent for flush-level events
    pub entity: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Commit or rollback without an active transaction
    NotActive,
    /// A nested flush failed and the outer transaction can only roll back
    RollbackOnly,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, timeouts, optimistic lock)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::Timeout),
            Error::OptimisticLock(_) => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Is this any constraint violation?
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Error::Constraint(_) => true,
            Error::Query(q) => q.kind == QueryErrorKind::Constraint,
            _ => false,
        }
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        match self {
            Error::Constraint(c) => c.kind == ConstraintKind::ForeignKey,
            Error::Query(q) => q.is_foreign_key_violation(),
            _ => false,
        }
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Constraint(c) => c.kind == ConstraintKind::Unique,
            Error::Query(q) => q.is_unique_violation(),
            _ => false,
        }
    }

    /// Is this an optimistic-lock failure?
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Constraint(c) => c.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Translate a driver error into its semantic form.
    ///
    /// Query errors whose SQLSTATE names an integrity violation become
    /// [`Error::Constraint`]; everything else is returned unchanged.
    #[must_use]
    pub fn translate(self) -> Self {
        let q = match self {
            Error::Query(q) => q,
            other => return other,
        };
        let kind = match q.sqlstate.as_deref() {
            Some("23503") => ConstraintKind::ForeignKey,
            Some("23505") => ConstraintKind::Unique,
            Some("23502") => ConstraintKind::NotNull,
            Some("23514") => ConstraintKind::Check,
            _ => return Error::Query(q),
        };
        Error::Constraint(ConstraintError {
            kind,
            table: None,
            constraint: None,
            message: q.message,
            sqlstate: q.sqlstate,
        })
    }

    /// Build a metadata error.
    pub fn metadata(
        kind: MetadataErrorKind,
        entity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Metadata(MetadataError {
            kind,
            entity: entity.into(),
            message: message.into(),
        })
    }

    /// Build an entity error.
    pub fn entity(
        kind: EntityErrorKind,
        entity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Entity(EntityError {
            kind,
            entity: entity.into(),
            message: message.into(),
        })
    }

    /// The entity error kind, if this is one.
    pub fn entity_kind(&self) -> Option<EntityErrorKind> {
        match self {
            Error::Entity(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Build a hook error from a message.
    pub fn hook(event: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Hook(HookError {
            event: event.into(),
            entity: None,
            message: message.into(),
            source: None,
        })
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Constraint(e) => write!(f, "Constraint violation: {}", e),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock failure: {}", e),
            Error::IdentityConflict(e) => write!(f, "Identity conflict: {}", e),
            Error::Ordering(e) => write!(f, "Flush ordering failure: {}", e),
            Error::ReentrantFlush => write!(
                f,
                "Re-entrant flush: a flush is already in progress on this session"
            ),
            Error::Metadata(e) => write!(f, "Metadata error: {}", e),
            Error::Cascade(e) => write!(f, "Cascade error: {}", e),
            Error::Entity(e) => write!(f, "Entity error: {}", e),
            Error::Hook(e) => write!(f, "Hook error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Hook(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintKind::ForeignKey => "foreign key",
            ConstraintKind::Unique => "unique",
            ConstraintKind::NotNull => "not null",
            ConstraintKind::Check => "check",
        };
        write!(f, "{}", name)
    }
}

impl fmt::Display for ConstraintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} constraint", self.kind)?;
        if let Some(table) = &self.table {
            write!(f, " on '{}'", table)?;
        }
        write!(f, ": {}", self.message)
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.expected_version {
            Some(version) => write!(
                f,
                "{} {} expected version {} but {} of {} rows matched",
                self.entity, self.key, version, self.affected_rows, self.expected_rows
            ),
            None => write!(
                f,
                "{} {} was expected to touch {} rows but touched {}",
                self.entity, self.key, self.expected_rows, self.affected_rows
            ),
        }
    }
}

impl fmt::Display for IdentityConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "another instance of {} with key {} is already managed by this session",
            self.entity, self.key
        )
    }
}

impl fmt::Display for OrderingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cycle.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} ({})", self.message, self.cycle.join(" -> "))
        }
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

impl fmt::Display for EntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

impl fmt::Display for CascadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} references a new {} that was neither persisted nor cascaded",
            self.entity, self.relation, self.target
        )
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{} on {}: {}", self.event, entity, self.message),
            None => write!(f, "{}: {}", self.event, self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

impl From<ConstraintError> for Error {
    fn from(err: ConstraintError) -> Self {
        Error::Constraint(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<OrderingError> for Error {
    fn from(err: OrderingError) -> Self {
        Error::Ordering(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

/// Result type alias for entmodel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn query_error(sqlstate: &str) -> Error {
        Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql: None,
            sqlstate: Some(sqlstate.to_string()),
            message: "violation".to_string(),
            source: None,
        })
    }

    #[test]
    fn translate_distinguishes_foreign_key_from_unique() {
        let fk = query_error("23503").translate();
        assert!(fk.is_foreign_key_violation());
        assert!(!fk.is_unique_violation());

        let unique = query_error("23505").translate();
        assert!(unique.is_unique_violation());
        assert!(matches!(
            unique,
            Error::Constraint(ConstraintError {
                kind: ConstraintKind::Unique,
                ..
            })
        ));
    }

    #[test]
    fn translate_leaves_other_errors_alone() {
        let err = query_error("40001").translate();
        assert!(matches!(err, Error::Query(_)));
        assert!(matches!(Error::ReentrantFlush.translate(), Error::ReentrantFlush));
    }

    #[test]
    fn optimistic_lock_is_retryable() {
        let err = Error::OptimisticLock(OptimisticLockError {
            entity: "Post".into(),
            key: "1".into(),
            expected_version: Some(crate::Value::BigInt(2)),
            expected_rows: 1,
            affected_rows: 0,
        });
        assert!(err.is_retryable());
        assert!(err.is_optimistic_lock());
        assert_eq!(
            err.to_string(),
            "Optimistic lock failure: Post 1 expected version 2 but 0 of 1 rows matched"
        );
    }

    #[test]
    fn ordering_error_renders_cycle() {
        let err = Error::Ordering(OrderingError {
            cycle: vec!["A#1".into(), "B#2".into(), "A#1".into()],
            message: "unresolvable cycle".into(),
        });
        assert_eq!(
            err.to_string(),
            "Flush ordering failure: unresolvable cycle (A#1 -> B#2 -> A#1)"
        );
    }

    #[test]
    fn entity_errors_expose_their_kind() {
        let err = Error::entity(EntityErrorKind::KeyArity, "Post", "expected 1 key value, got 2");
        assert_eq!(err.entity_kind(), Some(EntityErrorKind::KeyArity));
        assert_eq!(err.to_string(), "Entity error: Post: expected 1 key value, got 2");
        assert_eq!(Error::Cancelled.entity_kind(), None);
        assert!(!err.is_retryable());
    }
}
