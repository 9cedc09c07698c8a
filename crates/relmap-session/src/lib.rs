//! Unit of work, lifecycle manager and association resolver for relmap.
//!
//! `relmap-session` is the **execution layer**. A [`Session`] pins one
//! connection and runs everything the query layer builds against it:
//!
//! - **Reads**: `find`, `first`, `last`, `take`, `count`, `pluck`, with
//!   preloading and relation joins resolved into attached records.
//! - **Writes**: `create`, `save`, `updates`, `delete` and friends, with
//!   lifecycle hooks, auto timestamps and soft deletion.
//! - **Transactions**: manual `begin` / `commit` / `rollback` and the
//!   closure-scoped [`Session::transaction`], nesting through savepoints.
//!
//! Every operation is cancel-correct: the context is checked before each
//! statement, and a connection whose statement was cancelled or panicked is
//! marked for discard so a pool never hands it out again.
//!
//! # Example
//!
//! ```ignore
//! let mut session = try_outcome!(db.session(&cx).await);
//!
//! session
//!     .transaction(&cx, async |tx| {
//!         try_outcome!(tx.create(&cx, &mut user).await);
//!         let mut languages = try_result!(tx.association(&mut user, "Languages"));
//!         languages.append(&cx, &mut [rust, go]).await
//!     })
//!     .await
//! ```

pub mod association;
pub mod db;
pub mod lifecycle;
pub mod migrate;
pub mod preload;
pub mod read;

pub use association::Association;
pub use db::Db;
pub use lifecycle::WriteOptions;
pub use migrate::Migrator;

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use asupersync::{Cx, Outcome};
use relmap_core::{
    BoxFuture, Connection, Dialect, Error, Executor, HookContext, Operation, Row,
    TransactionErrorKind, Value,
};
use relmap_query::Statement;

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Run single write operations without an implicit BEGIN/COMMIT.
    pub skip_default_transaction: bool,
    /// Rows per INSERT statement in `create_many`.
    pub create_batch_size: usize,
    /// Statements slower than this are logged at WARN; 0 disables the check.
    pub slow_threshold_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            skip_default_transaction: false,
            create_batch_size: 100,
            slow_threshold_ms: 200,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_default_transaction(mut self, skip: bool) -> Self {
        self.skip_default_transaction = skip;
        self
    }

    pub fn create_batch_size(mut self, size: usize) -> Self {
        self.create_batch_size = size.max(1);
        self
    }

    pub fn slow_threshold(mut self, ms: u64) -> Self {
        self.slow_threshold_ms = ms;
        self
    }
}

/// Transaction state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// No transaction has been started.
    Idle,
    /// Inside BEGIN ... COMMIT/ROLLBACK.
    Active,
    Committed,
    RolledBack,
}

/// A unit of work pinned to one connection.
///
/// Dropping a session while its transaction is still active marks the
/// connection for discard: its transaction state is unknown to the pool.
pub struct Session<C: Connection> {
    conn: C,
    state: TxState,
    /// Open savepoints inside the active transaction.
    savepoints: usize,
    config: SessionConfig,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("savepoints", &self.savepoints)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Create a new session from an existing connection.
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, SessionConfig::default())
    }

    pub fn with_config(connection: C, config: SessionConfig) -> Self {
        Self {
            conn: connection,
            state: TxState::Idle,
            savepoints: 0,
            config,
        }
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn in_transaction(&self) -> bool {
        self.state == TxState::Active
    }

    // ========================================================================
    // Statement execution
    // ========================================================================

    fn after_statement(&self, table: &str, sql: &str, started: Instant) {
        let elapsed = started.elapsed();
        let threshold = self.config.slow_threshold_ms;
        if threshold > 0 && elapsed >= Duration::from_millis(threshold) {
            tracing::warn!(
                table,
                sql,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold,
                "slow statement"
            );
        }
    }

    fn settle<T>(&self, outcome: Outcome<T, Error>, op: Operation, table: &str) -> Outcome<T, Error> {
        match outcome {
            Outcome::Ok(v) => Outcome::Ok(v),
            Outcome::Err(e) => Outcome::Err(e.in_operation(op, table)),
            Outcome::Cancelled(r) => {
                tracing::warn!(table, %op, "statement cancelled, discarding connection");
                self.conn.discard();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                tracing::warn!(table, %op, "statement panicked, discarding connection");
                self.conn.discard();
                Outcome::Panicked(p)
            }
        }
    }

    pub(crate) async fn run_query(
        &self,
        cx: &Cx,
        stmt: &Statement,
        op: Operation,
        table: &str,
    ) -> Outcome<Vec<Row>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let started = Instant::now();
        let outcome = self.conn.query(cx, &stmt.sql, &stmt.params).await;
        self.after_statement(table, &stmt.sql, started);
        if let Outcome::Ok(rows) = &outcome {
            tracing::debug!(table, sql = %stmt.sql, row_count = rows.len(), "query");
        }
        self.settle(outcome, op, table)
    }

    pub(crate) async fn run_execute(
        &self,
        cx: &Cx,
        stmt: &Statement,
        op: Operation,
        table: &str,
    ) -> Outcome<u64, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let started = Instant::now();
        let outcome = self.conn.execute(cx, &stmt.sql, &stmt.params).await;
        self.after_statement(table, &stmt.sql, started);
        if let Outcome::Ok(affected) = &outcome {
            tracing::debug!(table, sql = %stmt.sql, row_count = *affected, "execute");
        }
        self.settle(outcome, op, table)
    }

    pub(crate) async fn run_insert(
        &self,
        cx: &Cx,
        stmt: &Statement,
        table: &str,
    ) -> Outcome<i64, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let started = Instant::now();
        let outcome = self.conn.insert(cx, &stmt.sql, &stmt.params).await;
        self.after_statement(table, &stmt.sql, started);
        if let Outcome::Ok(id) = &outcome {
            tracing::debug!(table, sql = %stmt.sql, last_insert_id = *id, "insert");
        }
        self.settle(outcome, Operation::Insert, table)
    }

    /// Transaction control statements skip the cancellation check: a
    /// ROLLBACK must still reach the server after the caller was cancelled.
    async fn control(&self, cx: &Cx, sql: &str) -> Outcome<(), Error> {
        tracing::trace!(sql, "transaction control");
        match self.conn.execute(cx, sql, &[]).await {
            Outcome::Ok(_) => Outcome::Ok(()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => {
                self.conn.discard();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.conn.discard();
                Outcome::Panicked(p)
            }
        }
    }

    pub(crate) fn hook_context<'a>(
        &'a self,
        cx: &'a Cx,
        operation: Operation,
        table: &'static str,
    ) -> HookContext<'a> {
        HookContext::new(cx, self, operation, table)
            .in_transaction(self.in_transaction())
            .now_nanos(now_nanos())
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a transaction.
    ///
    /// Fails while one is already active; use [`Session::transaction`] to
    /// nest work inside an open transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state == TxState::Active {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already active on this session",
            ));
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        match self.control(cx, "BEGIN").await {
            Outcome::Ok(()) => {
                self.state = TxState::Active;
                self.savepoints = 0;
                tracing::debug!("transaction started");
                Outcome::Ok(())
            }
            other => other,
        }
    }

    /// Commit the current transaction.
    ///
    /// A no-op after the transaction already committed or rolled back; an
    /// error when none was ever started. A failed COMMIT is followed by a
    /// ROLLBACK and leaves the session `RolledBack`.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.state {
            TxState::Committed | TxState::RolledBack => return Outcome::Ok(()),
            TxState::Idle => {
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::NotActive,
                    "commit without an active transaction",
                ));
            }
            TxState::Active => {}
        }
        match self.control(cx, "COMMIT").await {
            Outcome::Ok(()) => {
                self.state = TxState::Committed;
                self.savepoints = 0;
                tracing::debug!("transaction committed");
                Outcome::Ok(())
            }
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "commit failed, rolling back");
                if let Outcome::Err(rollback) = self.rollback(cx).await {
                    tracing::warn!(error = %rollback, "rollback after failed commit failed");
                }
                Outcome::Err(Error::Transaction(relmap_core::TransactionError {
                    kind: TransactionErrorKind::CommitFailed,
                    message: "COMMIT failed".to_string(),
                    source: Some(Box::new(e)),
                }))
            }
            // The connection is already marked for discard; the server side
            // state is unknown.
            Outcome::Cancelled(r) => {
                self.state = TxState::RolledBack;
                self.savepoints = 0;
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.state = TxState::RolledBack;
                self.savepoints = 0;
                Outcome::Panicked(p)
            }
        }
    }

    /// Roll back the current transaction. Same state rules as [`commit`](Self::commit).
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.state {
            TxState::Committed | TxState::RolledBack => return Outcome::Ok(()),
            TxState::Idle => {
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::NotActive,
                    "rollback without an active transaction",
                ));
            }
            TxState::Active => {}
        }
        let outcome = self.control(cx, "ROLLBACK").await;
        // The server ends the transaction on a failed ROLLBACK as well.
        self.state = TxState::RolledBack;
        self.savepoints = 0;
        match outcome {
            Outcome::Ok(()) => {
                tracing::debug!("transaction rolled back");
                Outcome::Ok(())
            }
            Outcome::Err(e) => {
                self.conn.discard();
                Outcome::Err(Error::Transaction(relmap_core::TransactionError {
                    kind: TransactionErrorKind::RollbackFailed,
                    message: "ROLLBACK failed".to_string(),
                    source: Some(Box::new(e)),
                }))
            }
            other => other,
        }
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok`; rolls back and returns the original
    /// outcome otherwise. When a transaction is already active, `f` runs in a
    /// savepoint instead and only the savepoint is rolled back on failure.
    pub async fn transaction<T, F>(&mut self, cx: &Cx, f: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Self) -> Outcome<T, Error>,
    {
        if self.state == TxState::Active {
            return self.savepoint(cx, f).await;
        }

        relmap_core::try_outcome!(self.begin(cx).await);
        let outcome = f(self).await;
        match outcome {
            Outcome::Ok(value) => {
                relmap_core::try_outcome!(self.commit(cx).await);
                Outcome::Ok(value)
            }
            failed => {
                if matches!(failed, Outcome::Cancelled(_) | Outcome::Panicked(_)) {
                    self.conn.discard();
                }
                if let Outcome::Err(e) = self.rollback(cx).await {
                    tracing::warn!(error = %e, "rollback after failed transaction body failed");
                }
                failed
            }
        }
    }

    async fn savepoint<T, F>(&mut self, cx: &Cx, f: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Self) -> Outcome<T, Error>,
    {
        let name = format!("sp_{}", self.savepoints + 1);
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        relmap_core::try_outcome!(
            self.control(cx, &format!("SAVEPOINT {name}")).await,
            |e| savepoint_error(&name, e)
        );
        self.savepoints += 1;

        let outcome = f(self).await;
        self.savepoints = self.savepoints.saturating_sub(1);
        match outcome {
            Outcome::Ok(value) => {
                relmap_core::try_outcome!(
                    self.control(cx, &format!("RELEASE SAVEPOINT {name}")).await,
                    |e| savepoint_error(&name, e)
                );
                Outcome::Ok(value)
            }
            failed => {
                if let Outcome::Err(e) = self
                    .control(cx, &format!("ROLLBACK TO SAVEPOINT {name}"))
                    .await
                {
                    tracing::warn!(savepoint = %name, error = %e, "rollback to savepoint failed");
                }
                failed
            }
        }
    }

    /// Run a write in its own transaction unless one is already active or
    /// implicit transactions are disabled.
    pub(crate) async fn write_scope<T, F>(&mut self, cx: &Cx, f: F) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Self) -> Outcome<T, Error>,
    {
        if self.config.skip_default_transaction || self.state == TxState::Active {
            f(self).await
        } else {
            self.transaction(cx, f).await
        }
    }
}

/// Hooks run their statements through the session, so they share its
/// connection, transaction and statement logging.
impl<C: Connection> Executor for Session<C> {
    fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    fn query<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(self.raw(cx, sql, params))
    }

    fn execute<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: Vec<Value>,
    ) -> BoxFuture<'a, Outcome<u64, Error>> {
        Box::pin(self.exec(cx, sql, params))
    }
}

impl<C: Connection> Drop for Session<C> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            tracing::warn!("session dropped inside an active transaction, discarding connection");
            self.conn.discard();
        }
    }
}

fn savepoint_error(name: &str, source: Error) -> Error {
    Error::Transaction(relmap_core::TransactionError {
        kind: TransactionErrorKind::Savepoint,
        message: format!("savepoint {name} failed"),
        source: Some(Box::new(source)),
    })
}

pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Columns of `values` whose key is `column`, or `Value::Null`.
pub(crate) fn value_of(values: &[(&'static str, Value)], column: &str) -> Value {
    values
        .iter()
        .find(|(name, _)| *name == column)
        .map_or(Value::Null, |(_, v)| v.clone())
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnection, block_on, expect_err, expect_ok};
    use relmap_core::ConstraintKind;

    #[test]
    fn session_config_defaults() {
        let config = SessionConfig::default();
        assert!(!config.skip_default_transaction);
        assert_eq!(config.create_batch_size, 100);
        assert_eq!(config.slow_threshold_ms, 200);
        assert_eq!(SessionConfig::new().create_batch_size(0).create_batch_size, 1);
    }

    #[test]
    fn commit_and_rollback_state_rules() {
        let conn = MockConnection::new();
        let mut session = Session::new(conn.clone());
        block_on(|cx| async move {
            let err = expect_err(session.commit(&cx).await);
            assert!(matches!(
                err,
                Error::Transaction(ref t) if t.kind == TransactionErrorKind::NotActive
            ));
            expect_err(session.rollback(&cx).await);

            expect_ok(session.begin(&cx).await);
            assert!(session.in_transaction());
            let err = expect_err(session.begin(&cx).await);
            assert!(matches!(
                err,
                Error::Transaction(ref t) if t.kind == TransactionErrorKind::AlreadyActive
            ));

            expect_ok(session.commit(&cx).await);
            assert_eq!(session.state(), TxState::Committed);
            expect_ok(session.commit(&cx).await);
            expect_ok(session.rollback(&cx).await);
        });
        assert_eq!(conn.executed_sql(), vec!["BEGIN", "COMMIT"]);
    }

    #[test]
    fn failed_body_rolls_back_and_surfaces_error() {
        let conn = MockConnection::new();
        conn.fail_execute_containing("'11'", ConstraintKind::Unique);
        let mut session = Session::new(conn.clone());
        block_on(|cx| async move {
            let err = expect_err(
                session
                    .transaction(&cx, async |tx| {
                        relmap_core::try_outcome!(
                            tx.exec(&cx, "INSERT INTO codes VALUES ('13')", vec![]).await
                        );
                        tx.exec(&cx, "INSERT INTO codes VALUES ('11')", vec![]).await
                    })
                    .await,
            );
            assert!(err.is_unique_violation());
            assert_eq!(session.state(), TxState::RolledBack);
        });
        let sql = conn.executed_sql();
        assert_eq!(sql.first().map(String::as_str), Some("BEGIN"));
        assert!(sql.iter().any(|s| s == "ROLLBACK"));
        assert!(!sql.iter().any(|s| s == "COMMIT"));
    }

    #[test]
    fn failed_commit_rolls_back_and_frees_the_session() {
        let conn = MockConnection::new();
        conn.fail_execute_containing("COMMIT", ConstraintKind::Check);
        let mut session = Session::new(conn.clone());
        block_on(|cx| async move {
            let err = expect_err(
                session
                    .transaction(&cx, async |tx| {
                        tx.exec(&cx, "INSERT INTO codes VALUES ('13')", vec![]).await
                    })
                    .await,
            );
            assert!(matches!(
                err,
                Error::Transaction(ref t) if t.kind == TransactionErrorKind::CommitFailed
            ));
            assert_eq!(session.state(), TxState::RolledBack);
            expect_ok(session.begin(&cx).await);
            assert!(session.in_transaction());
            expect_ok(session.rollback(&cx).await);
        });
        assert_eq!(
            conn.executed_sql(),
            vec![
                "BEGIN",
                "INSERT INTO codes VALUES ('13')",
                "COMMIT",
                "ROLLBACK",
                "BEGIN",
                "ROLLBACK"
            ]
        );
        assert!(!conn.was_discarded());
    }

    #[test]
    fn nested_transaction_uses_savepoint() {
        let conn = MockConnection::new();
        let mut session = Session::new(conn.clone());
        block_on(|cx| async move {
            let outcome: Outcome<(), Error> = session
                .transaction(&cx, async |tx| {
                    let inner: Outcome<(), Error> = tx
                        .transaction(&cx, async |_inner| {
                            Outcome::Err(Error::Custom("inner failed".into()))
                        })
                        .await;
                    assert!(matches!(inner, Outcome::Err(_)));
                    assert!(tx.in_transaction());
                    Outcome::Ok(())
                })
                .await;
            expect_ok(outcome);
        });
        assert_eq!(
            conn.executed_sql(),
            vec![
                "BEGIN",
                "SAVEPOINT sp_1",
                "ROLLBACK TO SAVEPOINT sp_1",
                "COMMIT"
            ]
        );
    }

    #[test]
    fn dropping_active_session_discards_connection() {
        let conn = MockConnection::new();
        let mut session = Session::new(conn.clone());
        block_on(|cx| async move {
            expect_ok(session.begin(&cx).await);
            drop(session);
        });
        assert!(conn.was_discarded());
    }
}
