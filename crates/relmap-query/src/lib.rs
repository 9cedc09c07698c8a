//! Query specification and statement builder for relmap.
//!
//! `relmap-query` is the **statement construction layer**. It turns declarative
//! conditions, projection, ordering, joins and locking into parameterized SQL
//! and never talks to a connection itself; the session layer executes what it
//! builds.
//!
//! - [`Query`] is the typed, chainable specification for one record type.
//! - [`SelectSpec`] is its untyped core, also used for related tables.
//! - [`InsertBuilder`], [`Assignments`] and the update/delete builders render writes.
//! - [`SqlWriter`] rewrites `?` placeholders into the connection's dialect.

pub mod builder;
pub mod clause;
pub mod condition;
pub mod join;
pub mod query;
pub mod select;
pub mod writer;

pub use builder::{
    AssignValue, Assignments, InsertBuilder, OnConflict, build_delete, build_soft_delete,
    build_update,
};
pub use clause::{LockMode, OrderBy, OrderDirection, quote_column};
pub use condition::{Condition, Connector, Term, json_to_value, render_terms};
pub use join::{ALIAS_SEPARATOR, JoinRequest, relation_columns, relation_join};
pub use query::{PreloadRequest, Query, Scope};
pub use select::{BuiltSelect, SelectSpec, Target};
pub use writer::{SqlWriter, Statement, count_placeholders};
