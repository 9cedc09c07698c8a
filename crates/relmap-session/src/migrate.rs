//! Schema migration boundary.
//!
//! relmap never issues DDL on its own. A [`Migrator`] receives the validated
//! descriptors of the record types an application cares about and brings the
//! store in line with them; [`Db::auto_migrate`](crate::Db::auto_migrate)
//! runs it on a pooled connection, outside any unit of work.

use std::future::Future;

use asupersync::{Cx, Outcome};
use relmap_core::{Connection, Error, RecordDescriptor};

/// Creates or alters tables to match record descriptors.
pub trait Migrator<C: Connection>: Send + Sync {
    /// Migrate the store behind `conn` so every descriptor has a table.
    fn migrate(
        &self,
        cx: &Cx,
        conn: &C,
        descriptors: &[&'static RecordDescriptor],
    ) -> impl Future<Output = Outcome<(), Error>> + Send;
}
