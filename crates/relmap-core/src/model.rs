//! Record mapping traits.
//!
//! A record type describes itself through [`Model`]: table name, key columns,
//! field metadata and relationships, plus the row conversions. The descriptor
//! is written by hand (or by a code generator) rather than discovered at
//! runtime, and [`crate::registry::describe`] validates and caches it.

use std::any::Any;
use std::future::Future;

use asupersync::{Cx, Outcome};

use crate::Result;
use crate::connection::Executor;
use crate::error::{AssociationErrorKind, Error, Operation};
use crate::field::FieldInfo;
use crate::relationship::RelationshipInfo;
use crate::row::Row;
use crate::value::Value;

/// Trait for types that can be mapped to database tables.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Default)]
/// struct Wallet {
///     id: String,
///     user_id: String,
///     balance: i64,
/// }
///
/// impl Model for Wallet {
///     const TABLE_NAME: &'static str = "wallets";
///     const PRIMARY_KEY: &'static [&'static str] = &["id"];
///
///     fn fields() -> &'static [FieldInfo] {
///         const FIELDS: &[FieldInfo] = &[
///             FieldInfo::new("id", "id", SqlType::VarChar(100)).primary_key(true),
///             FieldInfo::new("user_id", "user_id", SqlType::VarChar(100)),
///             FieldInfo::new("balance", "balance", SqlType::BigInt),
///         ];
///         FIELDS
///     }
///
///     fn to_row(&self) -> Vec<(&'static str, Value)> {
///         vec![
///             ("id", self.id.clone().into()),
///             ("user_id", self.user_id.clone().into()),
///             ("balance", self.balance.into()),
///         ]
///     }
///
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self {
///             id: row.get_or_default("id")?,
///             user_id: row.get_or_default("user_id")?,
///             balance: row.get_or_default("balance")?,
///         })
///     }
/// }
/// ```
pub trait Model: Sized + Clone + Send + Sync + 'static {
    /// The name of the database table.
    const TABLE_NAME: &'static str;

    /// The primary key column name(s).
    const PRIMARY_KEY: &'static [&'static str];

    /// Relationship declarations; empty for records without associations.
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[];

    /// Get field metadata for all columns.
    fn fields() -> &'static [FieldInfo];

    /// Convert this instance to `(column, value)` pairs.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct an instance from a database row.
    fn from_row(row: &Row) -> Result<Self>;

    /// Get the value of the primary key column(s).
    fn primary_key_value(&self) -> Vec<Value> {
        let row = self.to_row();
        Self::PRIMARY_KEY
            .iter()
            .map(|pk| {
                row.iter()
                    .find(|(col, _)| col == pk)
                    .map_or(Value::Null, |(_, v)| v.clone())
            })
            .collect()
    }

    /// Assign a column value in place.
    ///
    /// Used to back-fill store-assigned keys, maintain timestamp and
    /// soft-delete columns, and point foreign keys at a new owner.
    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        let _ = value;
        Err(Error::Custom(format!(
            "{} cannot assign column '{column}'",
            Self::TABLE_NAME
        )))
    }

    /// Receive loaded related records for the named relationship.
    ///
    /// Implementations downcast with [`downcast_one`] or [`downcast_many`].
    fn attach_related(&mut self, relation: &str, related: Vec<Box<dyn DynModel>>) -> Result<()> {
        let _ = related;
        Err(Error::association(
            AssociationErrorKind::UnknownRelationship,
            std::any::type_name::<Self>(),
            relation,
            "record does not accept related records",
        ))
    }

    /// Borrow the in-memory related records of a relationship so they can be
    /// saved alongside this record.
    fn associations_mut(&mut self, relation: &str) -> Vec<&mut dyn DynModel> {
        let _ = relation;
        Vec::new()
    }
}

/// Context handed to lifecycle hooks.
///
/// Besides describing the operation, it lends the hook the unit of work the
/// operation runs in: statements issued through [`exec`](Self::exec) and
/// [`query`](Self::query) share its connection and transaction, and roll
/// back with it.
#[derive(Clone, Copy)]
pub struct HookContext<'a> {
    pub operation: Operation,
    pub table: &'static str,
    /// Whether the write runs inside a transaction (explicit or implicit)
    pub in_transaction: bool,
    /// "Now" for this operation, in nanoseconds since the epoch
    pub now_nanos: i64,
    pub cx: &'a Cx,
    executor: &'a dyn Executor,
}

impl<'a> HookContext<'a> {
    pub fn new(
        cx: &'a Cx,
        executor: &'a dyn Executor,
        operation: Operation,
        table: &'static str,
    ) -> Self {
        Self {
            operation,
            table,
            in_transaction: false,
            now_nanos: 0,
            cx,
            executor,
        }
    }

    pub fn in_transaction(mut self, active: bool) -> Self {
        self.in_transaction = active;
        self
    }

    pub fn now_nanos(mut self, nanos: i64) -> Self {
        self.now_nanos = nanos;
        self
    }

    pub fn executor(&self) -> &'a dyn Executor {
        self.executor
    }

    /// Run a write inside the operation's unit of work.
    pub async fn exec(&self, sql: &str, params: Vec<Value>) -> Outcome<u64, Error> {
        self.executor.execute(self.cx, sql, params).await
    }

    /// Run a read inside the operation's unit of work.
    pub async fn query(&self, sql: &str, params: Vec<Value>) -> Outcome<Vec<Row>, Error> {
        self.executor.query(self.cx, sql, params).await
    }
}

impl std::fmt::Debug for HookContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookContext")
            .field("operation", &self.operation)
            .field("table", &self.table)
            .field("in_transaction", &self.in_transaction)
            .field("now_nanos", &self.now_nanos)
            .finish_non_exhaustive()
    }
}

/// Lifecycle hooks for record instances.
///
/// Every stage defaults to a no-op; a record participates in a stage by
/// overriding it, usually as an `async fn`. Returning an error aborts the
/// operation, and the implicit (or enclosing helper) transaction is rolled
/// back together with anything the hook ran through its context.
pub trait Hooks: Model {
    fn before_create(
        &mut self,
        ctx: &HookContext<'_>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let _ = ctx;
        async { Outcome::Ok(()) }
    }

    fn after_create(
        &mut self,
        ctx: &HookContext<'_>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let _ = ctx;
        async { Outcome::Ok(()) }
    }

    fn before_update(
        &mut self,
        ctx: &HookContext<'_>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let _ = ctx;
        async { Outcome::Ok(()) }
    }

    fn after_update(
        &mut self,
        ctx: &HookContext<'_>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let _ = ctx;
        async { Outcome::Ok(()) }
    }

    fn before_delete(
        &mut self,
        ctx: &HookContext<'_>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let _ = ctx;
        async { Outcome::Ok(()) }
    }

    fn after_delete(
        &mut self,
        ctx: &HookContext<'_>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let _ = ctx;
        async { Outcome::Ok(()) }
    }

    /// Called for every record decoded by a read.
    fn after_find(
        &mut self,
        ctx: &HookContext<'_>,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let _ = ctx;
        async { Outcome::Ok(()) }
    }
}

/// Object-safe view of a [`Model`], used where the concrete record type is
/// only known through a relationship descriptor.
pub trait DynModel: Any + Send + Sync {
    fn model_name(&self) -> &'static str;
    fn table_name(&self) -> &'static str;
    fn field_infos(&self) -> &'static [FieldInfo];
    fn relationship_infos(&self) -> &'static [RelationshipInfo];
    fn primary_key_columns(&self) -> &'static [&'static str];
    fn values(&self) -> Vec<(&'static str, Value)>;
    /// Current value of a column, `Value::Null` when unmapped.
    fn column_value(&self, column: &str) -> Value;
    fn primary_key(&self) -> Vec<Value>;
    fn assign(&mut self, column: &str, value: Value) -> Result<()>;
    fn attach(&mut self, relation: &str, related: Vec<Box<dyn DynModel>>) -> Result<()>;
    fn associated_mut(&mut self, relation: &str) -> Vec<&mut dyn DynModel>;
    fn clone_boxed(&self) -> Box<dyn DynModel>;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<M: Model> DynModel for M {
    fn model_name(&self) -> &'static str {
        std::any::type_name::<M>()
    }

    fn table_name(&self) -> &'static str {
        M::TABLE_NAME
    }

    fn field_infos(&self) -> &'static [FieldInfo] {
        M::fields()
    }

    fn relationship_infos(&self) -> &'static [RelationshipInfo] {
        M::RELATIONSHIPS
    }

    fn primary_key_columns(&self) -> &'static [&'static str] {
        M::PRIMARY_KEY
    }

    fn values(&self) -> Vec<(&'static str, Value)> {
        self.to_row()
    }

    fn column_value(&self, column: &str) -> Value {
        self.to_row()
            .into_iter()
            .find(|(name, _)| *name == column)
            .map_or(Value::Null, |(_, v)| v)
    }

    fn primary_key(&self) -> Vec<Value> {
        self.primary_key_value()
    }

    fn assign(&mut self, column: &str, value: Value) -> Result<()> {
        self.set_column(column, value)
    }

    fn attach(&mut self, relation: &str, related: Vec<Box<dyn DynModel>>) -> Result<()> {
        self.attach_related(relation, related)
    }

    fn associated_mut(&mut self, relation: &str) -> Vec<&mut dyn DynModel> {
        self.associations_mut(relation)
    }

    fn clone_boxed(&self) -> Box<dyn DynModel> {
        Box::new(self.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Decode a row into a boxed record; stored in relationship descriptors.
pub fn decode_boxed<M: Model>(row: &Row) -> Result<Box<dyn DynModel>> {
    M::from_row(row).map(|m| Box::new(m) as Box<dyn DynModel>)
}

fn downcast<T: Model>(record: Box<dyn DynModel>) -> Result<T> {
    let found = record.model_name();
    record.into_any().downcast::<T>().map(|b| *b).map_err(|_| {
        Error::association(
            AssociationErrorKind::TypeMismatch,
            std::any::type_name::<T>(),
            found,
            format!("expected {}, got {found}", std::any::type_name::<T>()),
        )
    })
}

/// Take the first related record, discarding the rest.
///
/// Single-valued relationships resolve to at most one record; when several
/// rows matched, the first in result order wins.
pub fn downcast_one<T: Model>(related: Vec<Box<dyn DynModel>>) -> Result<Option<T>> {
    related.into_iter().next().map(downcast::<T>).transpose()
}

/// Take every related record, in result order.
pub fn downcast_many<T: Model>(related: Vec<Box<dyn DynModel>>) -> Result<Vec<T>> {
    related.into_iter().map(downcast::<T>).collect()
}
