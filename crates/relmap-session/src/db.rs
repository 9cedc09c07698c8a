//! Shared database handle.
//!
//! A [`Db`] owns the connection pool and the factory that opens new
//! connections. It is cheap to clone; every clone hands out sessions from the
//! same pool.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use relmap_core::{Connection, Error, RecordDescriptor, try_outcome};
use relmap_pool::{Pool, PooledConnection};

use crate::migrate::Migrator;
use crate::{Session, SessionConfig};

type ConnectFuture<C> = Pin<Box<dyn Future<Output = Outcome<C, Error>> + Send>>;
type ConnectFn<C> = Arc<dyn Fn() -> ConnectFuture<C> + Send + Sync>;

/// Entry point for applications: a pool plus the settings every session
/// starts with.
pub struct Db<C: Connection> {
    pool: Pool<C>,
    connect: ConnectFn<C>,
    config: SessionConfig,
}

impl<C: Connection> Clone for Db<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            connect: Arc::clone(&self.connect),
            config: self.config.clone(),
        }
    }
}

impl<C: Connection> fmt::Debug for Db<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Db<C> {
    /// Create a handle over `pool`; `connect` opens a connection whenever the
    /// pool has room and nothing idle to reuse.
    pub fn new<F, Fut>(pool: Pool<C>, connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<C, Error>> + Send + 'static,
    {
        Self {
            pool,
            connect: Arc::new(move || Box::pin(connect()) as ConnectFuture<C>),
            config: SessionConfig::default(),
        }
    }

    /// Settings applied to every session this handle opens.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Check out a connection and wrap it in a new unit of work.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn session(&self, cx: &Cx) -> Outcome<Session<PooledConnection<C>>, Error> {
        let conn = try_outcome!(self.pool.acquire(cx, || (self.connect)()).await);
        Outcome::Ok(Session::with_config(conn, self.config.clone()))
    }

    /// A session with a transaction already started.
    pub async fn begin(&self, cx: &Cx) -> Outcome<Session<PooledConnection<C>>, Error> {
        let mut session = try_outcome!(self.session(cx).await);
        try_outcome!(session.begin(cx).await);
        Outcome::Ok(session)
    }

    /// Run `migrator` over `descriptors` on a pooled connection.
    #[tracing::instrument(level = "info", skip_all, fields(models = descriptors.len()))]
    pub async fn auto_migrate<Mg>(
        &self,
        cx: &Cx,
        migrator: &Mg,
        descriptors: &[&'static RecordDescriptor],
    ) -> Outcome<(), Error>
    where
        Mg: Migrator<C>,
    {
        let conn = try_outcome!(self.pool.acquire(cx, || (self.connect)()).await);
        try_outcome!(migrator.migrate(cx, &conn, descriptors).await);
        tracing::info!("schema migrated");
        Outcome::Ok(())
    }

    /// Close the pool; connections already checked out are dropped on release.
    pub fn close(&self) {
        self.pool.close();
    }
}
