//! relmap - struct-to-relational mapping with associations and transactions.
//!
//! relmap persists plain Rust structs to a relational store and reads them
//! back without hand-written SQL per entity:
//!
//! - Declarative queries: conditions, ordering, projection, grouping,
//!   pagination, row locks and reusable scopes
//! - Associations: belongs-to, has-one, has-many and many-to-many, loaded by
//!   preload or join and mutated through append / replace / delete / clear
//! - Units of work: implicit write transactions, nested savepoints, soft
//!   deletion, auto timestamps and lifecycle hooks
//! - Bounded connection pooling with structured concurrency
//!
//! The wire driver and schema migration stay outside: implement
//! [`Connection`] for your driver and [`Migrator`] for your DDL tooling.
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! async fn adults(db: &Db<MyDriver>, cx: &Cx) -> Outcome<Vec<User>, Error> {
//!     let session = try_outcome!(db.session(cx).await);
//!     session
//!         .find(
//!             cx,
//!             Query::<User>::new()
//!                 .filter("age >= ?", vec![Value::Int(18)])
//!                 .order("name asc")
//!                 .preload("Pets"),
//!         )
//!         .await
//! }
//! ```

pub use relmap_core::{
    AssociationError, AssociationErrorKind, ColumnInfo, ConfigError, ConnectionError,
    ConnectionErrorKind, Connection, ConstraintError, ConstraintKind, ContextError, Cx, Dialect,
    DynModel, Error, Executor, FieldInfo, FromRow, FromValue, HookContext, HookError, Hooks,
    LinkTableInfo, Model, NotFoundError, Operation, Outcome, PoolError, PoolErrorKind, QueryError,
    QueryErrorKind, RecordDescriptor, RelatedModel, RelationshipInfo, RelationshipKind, Result,
    Row, SchemaError, SchemaErrorKind, SqlType, TimeUnit, TransactionError, TransactionErrorKind,
    TypeError, Value, describe, downcast_many, downcast_one, registered_join_tables, try_outcome,
    try_result,
};

pub use relmap_query::{
    AssignValue, Assignments, Condition, JoinRequest, LockMode, OnConflict, OrderBy,
    OrderDirection, PreloadRequest, Query, Scope, SelectSpec, Statement,
};

pub use relmap_pool::{Pool, PoolConfig, PoolStats, PooledConnection};

pub use relmap_session::{
    Association, Db, Migrator, Session, SessionConfig, TxState, WriteOptions,
};

/// Everything an application typically needs in scope.
pub mod prelude {
    pub use crate::{
        // Records
        Connection,
        Cx,
        Error,
        FieldInfo,
        HookContext,
        Hooks,
        Model,
        Outcome,
        RelatedModel,
        RelationshipInfo,
        RelationshipKind,
        Result,
        Row,
        SqlType,
        TimeUnit,
        Value,
        // Querying
        Assignments,
        Condition,
        LockMode,
        OnConflict,
        OrderBy,
        Query,
        // Execution
        Db,
        Migrator,
        Pool,
        PoolConfig,
        Session,
        SessionConfig,
        WriteOptions,
        // Outcome plumbing
        try_outcome,
        try_result,
    };
}
