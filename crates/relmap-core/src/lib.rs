//! Core types and traits for relmap.
//!
//! This crate provides the foundational abstractions the query builder and the
//! session layer are written against:
//!
//! - `Model` / `Hooks` for mapping record types to tables
//! - `FieldInfo` and `RelationshipInfo` static metadata
//! - the schema registry producing validated `RecordDescriptor`s
//! - `Value` / `Row` for parameters and results
//! - the `Connection` executor boundary and the `Executor` view hooks run
//!   statements through
//! - `Outcome` / `Cx` re-exported from asupersync for cancel-correct operations

pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod error;
pub mod field;
pub mod model;
pub mod registry;
pub mod relationship;
pub mod row;
pub mod value;

pub use connection::{BoxFuture, Connection, Executor};
pub use dialect::{Dialect, is_plain_identifier, is_qualified_identifier};
pub use error::{
    AssociationError, AssociationErrorKind, ConfigError, ConnectionError, ConnectionErrorKind,
    ConstraintError, ConstraintKind, ContextError, Error, HookError, NotFoundError, Operation,
    PoolError, PoolErrorKind, QueryError, QueryErrorKind, Result, SchemaError, SchemaErrorKind,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use field::{FieldInfo, SqlType, TimeUnit};
pub use model::{DynModel, HookContext, Hooks, Model, decode_boxed, downcast_many, downcast_one};
pub use registry::{
    JoinTableEntry, RecordDescriptor, describe, find_relationship, registered_join_tables,
};
pub use relationship::{LinkTableInfo, RelatedModel, RelationshipInfo, RelationshipKind};
pub use row::{ColumnInfo, FromRow, FromValue, Row};
pub use value::{Value, key_hash};

/// Unwrap an `Outcome::Ok`, returning any other outcome from the enclosing
/// function unchanged.
///
/// An optional second argument maps the error before it is returned.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
    ($expr:expr, $map_err:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(($map_err)(e)),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Lift a `Result` into the enclosing `Outcome`-returning function.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return $crate::Outcome::Err(e),
        }
    };
}
