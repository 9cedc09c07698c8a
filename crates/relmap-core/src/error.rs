//! Error types for relmap operations.

use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, broken pipe)
    Connection(ConnectionError),
    /// Statement execution errors reported by the executor
    Query(QueryError),
    /// Unique/foreign-key/check violations reported by the executor
    Constraint(ConstraintError),
    /// Type conversion errors while decoding rows
    Type(TypeError),
    /// Transaction state or commit/rollback failures
    Transaction(TransactionError),
    /// Pool errors
    Pool(PoolError),
    /// Misconfigured record type or relationship
    Schema(SchemaError),
    /// A single-result query matched zero rows
    NotFound(NotFoundError),
    /// Association mutation on an owner without a resolved key
    Association(AssociationError),
    /// Locking read requested outside of an active transaction
    LockWithoutTransaction {
        /// Table the locking read targeted
        table: String,
    },
    /// Executor failure annotated with the operation and table it happened in
    Context(ContextError),
    /// A lifecycle hook refused the operation
    Hook(HookError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation timed out
    Timeout,
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
    /// Connection was discarded because its state became unknown
    Discarded,
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
    /// Syntax error in SQL
    Syntax,
    /// Placeholder count does not match the bound parameters
    ParameterMismatch,
    /// Bulk UPDATE/DELETE without any WHERE condition
    MissingWhereClause,
    /// Table or column not found
    UnknownObject,
    /// Deadlock detected
    Deadlock,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

/// A constraint violation, surfaced as reported by the executor.
#[derive(Debug)]
pub struct ConstraintError {
    pub kind: ConstraintKind,
    /// Constraint name, when the executor reports it
    pub constraint: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    NotNull,
    Check,
    Other,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Commit/rollback requested while no transaction was begun
    NotActive,
    /// Begin requested while a transaction is already active
    AlreadyActive,
    /// COMMIT failed in the executor
    CommitFailed,
    /// ROLLBACK failed in the executor
    RollbackFailed,
    /// Savepoint handling failed
    Savepoint,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    /// Record type the error was raised for
    pub model: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// No primary key could be determined
    MissingPrimaryKey,
    /// A relationship key names a column the record does not have
    UnknownForeignKey,
    /// Two declarations of the same join table disagree
    JoinTableConflict,
    /// A table or column name is not a plain SQL identifier
    InvalidIdentifier,
    /// Relationship name not declared on the record type
    UnknownRelationship,
}

#[derive(Debug)]
pub struct NotFoundError {
    pub table: String,
    pub sql: Option<String>,
}

#[derive(Debug)]
pub struct AssociationError {
    pub kind: AssociationErrorKind,
    pub model: &'static str,
    pub relationship: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationErrorKind {
    /// The owner record has no resolved primary key
    OwnerKeyMissing,
    /// The record type declares no relationship with that name
    UnknownRelationship,
    /// Related records of an unexpected type were handed over
    TypeMismatch,
    /// The relationship kind does not support the requested mutation
    Unsupported,
}

/// Which mapping operation was running when an executor error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Select,
    Count,
    Insert,
    Update,
    Delete,
    Preload,
    Association,
    Raw,
}

#[derive(Debug)]
pub struct ContextError {
    pub operation: Operation,
    pub table: String,
    pub source: Box<Error>,
}

#[derive(Debug)]
pub struct HookError {
    pub stage: &'static str,
    pub model: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Wrap an executor error with the operation and table it happened in.
    ///
    /// Errors raised by the mapping layer itself (not found, schema, association,
    /// locking, hooks) already carry their context and are returned unchanged.
    pub fn in_operation(self, operation: Operation, table: impl Into<String>) -> Self {
        match self {
            Error::Connection(_)
            | Error::Query(_)
            | Error::Constraint(_)
            | Error::Type(_)
            | Error::Transaction(_) => Error::Context(ContextError {
                operation,
                table: table.into(),
                source: Box::new(self),
            }),
            other => other,
        }
    }

    /// The innermost error, looking through context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context(c) => c.source.root(),
            other => other,
        }
    }

    /// Did a single-result query match zero rows?
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    /// Is this a constraint violation reported by the executor?
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self.root(), Error::Constraint(_))
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        matches!(self.root(), Error::Constraint(c) if c.kind == ConstraintKind::Unique)
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self.root(), Error::Connection(_))
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self.root() {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Constraint(c) => c.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self.root() {
            Error::Query(q) => q.sql.as_deref(),
            Error::NotFound(n) => n.sql.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn schema(
        kind: SchemaErrorKind,
        model: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Error::Schema(SchemaError {
            kind,
            model,
            message: message.into(),
        })
    }

    /// Build an association error for `model.relationship`.
    pub fn association(
        kind: AssociationErrorKind,
        model: &'static str,
        relationship: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Association(AssociationError {
            kind,
            model,
            relationship: relationship.into(),
            message: message.into(),
        })
    }

    /// Build a hook failure for the given stage.
    pub fn hook(stage: &'static str, model: &'static str, message: impl Into<String>) -> Self {
        Error::Hook(HookError {
            stage,
            model,
            message: message.into(),
        })
    }

    /// Build a transaction state error.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a statement construction error.
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            sql: None,
            sqlstate: None,
            message: message.into(),
            source: None,
        })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Select => "select",
            Operation::Count => "count",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Preload => "preload",
            Operation::Association => "association",
            Operation::Raw => "raw",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {e}"),
            Error::Constraint(e) => write!(f, "Constraint violation: {e}"),
            Error::Type(e) => write!(f, "Type error: {e}"),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error on {}: {}", e.model, e.message),
            Error::NotFound(e) => write!(f, "record not found in '{}'", e.table),
            Error::Association(e) => write!(
                f,
                "Association error on {}.{}: {}",
                e.model, e.relationship, e.message
            ),
            Error::LockWithoutTransaction { table } => write!(
                f,
                "locking read on '{table}' requires an active transaction"
            ),
            Error::Context(e) => write!(f, "{} on '{}' failed: {}", e.operation, e.table, e.source),
            Error::Hook(e) => write!(f, "{} hook on {} failed: {}", e.stage, e.model, e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Timeout => write!(f, "Operation timed out"),
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
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Transaction(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Context(e) => Some(e.source.as_ref()),
            _ => None,
        }
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

impl fmt::Display for ConstraintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.constraint {
            Some(name) => write!(f, "{} ({})", self.message, name),
            None => write!(f, "{}", self.message),
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

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConstraintError> for Error {
    fn from(err: ConstraintError) -> Self {
        Error::Constraint(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
