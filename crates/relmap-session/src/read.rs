//! Read operations.

use std::collections::HashMap;

use asupersync::{Cx, Outcome};
use relmap_core::{
    Connection, DynModel, Error, FromRow, FromValue, Hooks, Model, NotFoundError, Operation,
    RelationshipInfo, Result, Row, Value, key_hash, try_outcome, try_result,
};
use relmap_query::{ALIAS_SEPARATOR, OrderBy, Query, SqlWriter, Statement};

use crate::{Session, preload};

impl<C: Connection> Session<C> {
    fn check_lock<M: Model>(&self, query: &Query<M>) -> Result<()> {
        if query.lock_mode().is_some() && !self.in_transaction() {
            return Err(Error::LockWithoutTransaction {
                table: query.table_name().to_string(),
            });
        }
        Ok(())
    }

    /// Run a SELECT, decode, resolve preloads and fire `after_find`.
    async fn load<M: Hooks>(&self, cx: &Cx, query: Query<M>) -> Outcome<(Vec<M>, Statement), Error> {
        let query = query.resolve();
        try_result!(self.check_lock(&query));

        let built = try_result!(query.build_select(self.conn.dialect()));
        let rows = try_outcome!(
            self.run_query(cx, &built.statement, Operation::Select, query.table_name())
                .await
        );
        let mut records = if built.joined.is_empty() {
            try_result!(rows.iter().map(M::from_row).collect::<Result<Vec<M>>>())
        } else {
            try_result!(decode_joined::<M>(&rows, &built.joined))
        };

        try_outcome!(preload::preload_records(self, cx, &mut records, &query).await);

        let ctx = self.hook_context(cx, Operation::Select, M::TABLE_NAME);
        for record in &mut records {
            try_outcome!(record.after_find(&ctx).await);
        }
        Outcome::Ok((records, built.statement))
    }

    async fn load_one<M: Hooks>(&self, cx: &Cx, query: Query<M>) -> Outcome<M, Error> {
        let table = query.table_name().to_string();
        let (records, statement) = try_outcome!(self.load(cx, query).await);
        match records.into_iter().next() {
            Some(record) => Outcome::Ok(record),
            None => Outcome::Err(Error::NotFound(NotFoundError {
                table,
                sql: Some(statement.sql),
            })),
        }
    }

    /// All records matching the query; zero rows is an empty vec.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(table = M::TABLE_NAME))]
    pub async fn find<M: Hooks>(&self, cx: &Cx, query: Query<M>) -> Outcome<Vec<M>, Error> {
        let (records, _) = try_outcome!(self.load(cx, query).await);
        Outcome::Ok(records)
    }

    /// First record by primary key. `NotFound` when nothing matches.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(table = M::TABLE_NAME))]
    pub async fn first<M: Hooks>(&self, cx: &Cx, query: Query<M>) -> Outcome<M, Error> {
        let query = order_by_key(query, OrderBy::asc).limit(1);
        self.load_one(cx, query).await
    }

    /// Last record by primary key. `NotFound` when nothing matches.
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(table = M::TABLE_NAME))]
    pub async fn last<M: Hooks>(&self, cx: &Cx, query: Query<M>) -> Outcome<M, Error> {
        let query = order_by_key(query, OrderBy::desc).limit(1);
        self.load_one(cx, query).await
    }

    /// Any one matching record, in store order.
    pub async fn take<M: Hooks>(&self, cx: &Cx, query: Query<M>) -> Outcome<M, Error> {
        self.load_one(cx, query.limit(1)).await
    }

    pub async fn count<M: Model>(&self, cx: &Cx, query: Query<M>) -> Outcome<i64, Error> {
        let stmt = try_result!(query.build_count(self.conn.dialect()));
        let rows = try_outcome!(
            self.run_query(cx, &stmt, Operation::Count, query.table_name())
                .await
        );
        Outcome::Ok(
            rows.first()
                .and_then(|r| r.get(0))
                .and_then(Value::as_i64)
                .unwrap_or(0),
        )
    }

    pub async fn exists<M: Model>(&self, cx: &Cx, query: Query<M>) -> Outcome<bool, Error> {
        let n = try_outcome!(self.count(cx, query).await);
        Outcome::Ok(n > 0)
    }

    /// Decode matching rows into a non-record type (projections, aggregates).
    ///
    /// Preloads and hooks do not apply.
    pub async fn find_as<M: Model, T: FromRow>(
        &self,
        cx: &Cx,
        query: Query<M>,
    ) -> Outcome<Vec<T>, Error> {
        let query = query.resolve();
        try_result!(self.check_lock(&query));
        let built = try_result!(query.build_select(self.conn.dialect()));
        let rows = try_outcome!(
            self.run_query(cx, &built.statement, Operation::Select, query.table_name())
                .await
        );
        Outcome::Ok(try_result!(rows.iter().map(T::from_row).collect()))
    }

    /// Values of a single column.
    pub async fn pluck<M: Model, T: FromValue>(
        &self,
        cx: &Cx,
        query: Query<M>,
        column: &str,
    ) -> Outcome<Vec<T>, Error> {
        let rows: Vec<Row> = try_outcome!(self.find_as(cx, query.select([column])).await);
        Outcome::Ok(try_result!(rows.iter().map(|r| r.get_as::<T>(0)).collect()))
    }

    /// Run raw SQL with `?` placeholders and return the rows.
    pub async fn raw(&self, cx: &Cx, sql: &str, params: Vec<Value>) -> Outcome<Vec<Row>, Error> {
        let mut w = SqlWriter::new(self.conn.dialect());
        let rendered = try_result!(w.fragment(sql, &params));
        let stmt = w.finish(rendered);
        self.run_query(cx, &stmt, Operation::Raw, "raw").await
    }

    pub async fn raw_as<T: FromRow>(
        &self,
        cx: &Cx,
        sql: &str,
        params: Vec<Value>,
    ) -> Outcome<Vec<T>, Error> {
        let rows = try_outcome!(self.raw(cx, sql, params).await);
        Outcome::Ok(try_result!(rows.iter().map(T::from_row).collect()))
    }
}

fn order_by_key<M: Model>(query: Query<M>, by: fn(String) -> OrderBy) -> Query<M> {
    let table = query.table_name().to_string();
    M::PRIMARY_KEY
        .iter()
        .fold(query, |q, pk| q.order(by(format!("{table}.{pk}"))))
}

/// Decode relation-joined rows.
///
/// Owners are deduplicated by primary key in first-appearance order; every
/// related match is kept. A related side whose key columns are all NULL is a
/// LEFT JOIN miss and yields nothing.
fn decode_joined<M: Model>(rows: &[Row], joined: &[&'static RelationshipInfo]) -> Result<Vec<M>> {
    let mut owners: Vec<(M, Vec<Vec<Box<dyn DynModel>>>)> = Vec::new();
    let mut seen: HashMap<u64, usize> = HashMap::new();

    for row in rows {
        let owner = M::from_row(row)?;
        let key = key_hash(&owner.primary_key_value());
        let slot = match seen.get(&key) {
            Some(&slot) => slot,
            None => {
                owners.push((owner, joined.iter().map(|_| Vec::new()).collect()));
                seen.insert(key, owners.len() - 1);
                owners.len() - 1
            }
        };

        for (i, rel) in joined.iter().enumerate() {
            let related = row.subset_by_prefix(&format!("{}{ALIAS_SEPARATOR}", rel.name));
            let missed = rel
                .related
                .primary_key
                .iter()
                .all(|pk| related.get_by_name(pk).is_none_or(Value::is_null));
            if missed {
                continue;
            }
            owners[slot].1[i].push(rel.related.decode(&related)?);
        }
    }

    owners
        .into_iter()
        .map(|(mut owner, buckets)| {
            for (rel, related) in joined.iter().zip(buckets) {
                owner.attach_related(rel.name, related)?;
            }
            Ok(owner)
        })
        .collect()
}
