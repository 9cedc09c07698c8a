//! The executor boundary.
//!
//! relmap never speaks a wire protocol itself. Drivers implement
//! [`Connection`]; everything above it renders statements and hands them
//! over together with their positional parameters.

use std::future::Future;
use std::pin::Pin;

use asupersync::{Cx, Outcome};

use crate::dialect::Dialect;
use crate::row::Row;
use crate::value::Value;

/// A database connection capable of executing statements.
///
/// All operations are async and take a `Cx` context for cancellation/timeout support.
/// Implementations must be `Send + Sync` for use across async boundaries.
///
/// Transactions are driven with plain `BEGIN` / `COMMIT` / `ROLLBACK` /
/// `SAVEPOINT` statements through [`execute`](Connection::execute); the
/// session layer owns the state machine.
///
/// # Example
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT * FROM users WHERE id = $1", &[Value::Int(1)]).await;
/// let affected = conn.execute(&cx, "DELETE FROM users WHERE id = $1", &[Value::Int(1)]).await;
/// ```
pub trait Connection: Send + Sync {
    /// Placeholder and quoting style statements for this connection must use.
    fn dialect(&self) -> Dialect {
        Dialect::default()
    }

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a query and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, crate::Error>> + Send {
        async move {
            match self.query(cx, sql, params).await {
                Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    /// Execute a statement (INSERT, UPDATE, DELETE, DDL) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Execute an INSERT and return the last inserted ID.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, crate::Error>> + Send;

    /// Check if the connection is still valid by sending a ping.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Check if the connection is still valid (alias for ping that returns bool).
    fn is_valid(&self, cx: &Cx) -> impl Future<Output = bool> + Send {
        async {
            match self.ping(cx).await {
                Outcome::Ok(()) => true,
                Outcome::Err(_) | Outcome::Cancelled(_) | Outcome::Panicked(_) => false,
            }
        }
    }

    /// Hint that the connection's protocol or transaction state is unknown
    /// and it must not be reused. Pooled connections honor it on release.
    fn discard(&self) {}
}

/// Future returned by [`Executor`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe statement runner over a unit of work's connection.
///
/// Lifecycle hooks receive one through [`HookContext`](crate::HookContext),
/// so what they run joins the enclosing transaction. SQL uses `?`
/// placeholders, rewritten for the connection's dialect.
pub trait Executor: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run a statement returning rows.
    fn query<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, crate::Error>>;

    /// Run a statement and return rows affected.
    fn execute<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Outcome<u64, crate::Error>>;
}
