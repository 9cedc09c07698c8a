//! Write operations and lifecycle hooks.
//!
//! Single-record writes run their hooks and association saves inside the
//! session's implicit write transaction, so a failing hook or association
//! insert leaves nothing behind.

use std::collections::BTreeMap;

use asupersync::{Cx, Outcome};
use relmap_core::{
    Connection, DynModel, Error, FieldInfo, Hooks, Model, Operation, QueryErrorKind,
    RelationshipKind, Result, Value, describe, try_outcome, try_result,
};
use relmap_query::{Assignments, Condition, InsertBuilder, OnConflict, Query, SqlWriter};

use crate::{Session, now_nanos, value_of};

/// Per-call options for `create` and batch inserts.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Skip saving in-memory associations.
    pub omit_associations: bool,
    /// Columns left out of the INSERT.
    pub omit_columns: Vec<String>,
    /// Upsert behaviour; the conflict target is the primary key.
    pub on_conflict: Option<OnConflict>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn omit_associations(mut self) -> Self {
        self.omit_associations = true;
        self
    }

    pub fn omit<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.omit_columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn on_conflict(mut self, action: OnConflict) -> Self {
        self.on_conflict = Some(action);
        self
    }

    fn omits(&self, column: &str) -> bool {
        self.omit_columns.iter().any(|c| c == column)
    }
}

/// Single auto-increment primary key column, if any.
fn auto_increment_column(
    primary_key: &[&'static str],
    fields: &'static [FieldInfo],
) -> Option<&'static str> {
    match primary_key {
        [pk] => fields
            .iter()
            .find(|f| f.column_name == *pk && f.auto_increment)
            .map(|f| f.column_name),
        _ => None,
    }
}

/// Fill auto-maintained timestamp columns.
///
/// On create only zero columns are stamped; on update the update-time
/// columns are always moved to `now`.
fn stamp_times(record: &mut dyn DynModel, now: i64, creating: bool) -> Result<()> {
    for field in record.field_infos() {
        let unit = if creating {
            field.auto_create_time.or(field.auto_update_time)
        } else {
            field.auto_update_time
        };
        let Some(unit) = unit else { continue };
        if creating && !record.column_value(field.column_name).is_zero() {
            continue;
        }
        record.assign(field.column_name, unit.value_at(now))?;
    }
    Ok(())
}

/// Equality on the record's primary key.
///
/// Zero is a legitimate caller-assigned key; only an unset auto-increment
/// key is rejected.
pub(crate) fn key_condition<M: Model>(record: &M) -> Result<Condition> {
    let key = record.primary_key_value();
    let auto = auto_increment_column(M::PRIMARY_KEY, M::fields());
    let unset = M::PRIMARY_KEY
        .iter()
        .zip(&key)
        .any(|(column, value)| Some(*column) == auto && value.is_zero());
    if unset {
        return Err(Error::query(
            QueryErrorKind::MissingWhereClause,
            format!("{} record has no primary key value", M::TABLE_NAME),
        ));
    }
    Ok(Condition::from_map(M::PRIMARY_KEY.iter().copied().zip(key)))
}

impl<C: Connection> Session<C> {
    // ========================================================================
    // Create
    // ========================================================================

    /// Insert one record, its associations and hooks, in one write scope.
    #[tracing::instrument(level = "debug", skip_all, fields(table = M::TABLE_NAME))]
    pub async fn create<M: Hooks>(&mut self, cx: &Cx, record: &mut M) -> Outcome<(), Error> {
        self.create_with(cx, record, &WriteOptions::default()).await
    }

    pub async fn create_with<M: Hooks>(
        &mut self,
        cx: &Cx,
        record: &mut M,
        options: &WriteOptions,
    ) -> Outcome<(), Error> {
        self.write_scope(cx, async |s| s.create_record(cx, record, options).await)
            .await
    }

    pub(crate) async fn create_record<M: Hooks>(
        &self,
        cx: &Cx,
        record: &mut M,
        options: &WriteOptions,
    ) -> Outcome<(), Error> {
        let ctx = self.hook_context(cx, Operation::Insert, M::TABLE_NAME);
        try_outcome!(record.before_create(&ctx).await);

        if !options.omit_associations {
            for rel in M::RELATIONSHIPS
                .iter()
                .filter(|r| r.kind == RelationshipKind::BelongsTo)
            {
                let key = {
                    let mut parents = record.associations_mut(rel.name);
                    let Some(parent) = parents.first_mut() else {
                        continue;
                    };
                    try_outcome!(self.save_associated(cx, &mut **parent, None).await);
                    parent.column_value(rel.remote_key)
                };
                try_result!(record.set_column(rel.local_key, key));
            }
        }

        try_result!(stamp_times(record, ctx.now_nanos, true));
        try_outcome!(
            self.insert_dyn(cx, record, &options.omit_columns, options.on_conflict.as_ref())
                .await
        );

        if !options.omit_associations {
            try_outcome!(self.save_dependents(cx, record).await);
        }

        try_outcome!(record.after_create(&ctx).await);
        Outcome::Ok(())
    }

    /// Save has-one, has-many and many-to-many associations of a stored owner.
    async fn save_dependents<M: Model>(&self, cx: &Cx, record: &mut M) -> Outcome<(), Error> {
        let dialect = self.conn.dialect();
        for rel in M::RELATIONSHIPS {
            let owner_key = record.column_value(rel.local_key);
            match (rel.kind, rel.link_table) {
                (RelationshipKind::BelongsTo, _) => {}
                (RelationshipKind::ManyToMany, Some(link)) => {
                    for child in record.associations_mut(rel.name) {
                        try_outcome!(
                            self.save_associated(cx, &mut *child, Some(OnConflict::DoNothing))
                                .await
                        );
                        let stmt = try_result!(
                            InsertBuilder::new(link.table_name)
                                .columns([link.local_column, link.remote_column])
                                .row(vec![owner_key.clone(), child.column_value(rel.remote_key)])
                                .on_conflict(OnConflict::DoNothing)
                                .conflict_target([link.local_column, link.remote_column])
                                .build(dialect)
                        );
                        try_outcome!(
                            self.run_execute(cx, &stmt, Operation::Association, link.table_name)
                                .await
                        );
                    }
                }
                _ => {
                    for child in record.associations_mut(rel.name) {
                        try_result!(child.assign(rel.remote_key, owner_key.clone()));
                        let repoint = OnConflict::Update(vec![rel.remote_key.to_string()]);
                        try_outcome!(self.save_associated(cx, &mut *child, Some(repoint)).await);
                    }
                }
            }
        }
        Outcome::Ok(())
    }

    /// Insert an associated record, or apply `on_conflict` when its key is
    /// already set. Hooks do not run for associated records.
    async fn save_associated(
        &self,
        cx: &Cx,
        record: &mut dyn DynModel,
        on_conflict: Option<OnConflict>,
    ) -> Outcome<(), Error> {
        try_result!(stamp_times(record, now_nanos(), true));
        let keyed = !record.primary_key().iter().all(Value::is_zero);
        let action = if keyed {
            Some(on_conflict.unwrap_or(OnConflict::DoNothing))
        } else {
            None
        };
        try_outcome!(self.insert_dyn(cx, record, &[], action.as_ref()).await);
        Outcome::Ok(())
    }

    /// INSERT one record and back-fill a store-assigned key.
    async fn insert_dyn(
        &self,
        cx: &Cx,
        record: &mut dyn DynModel,
        omit: &[String],
        on_conflict: Option<&OnConflict>,
    ) -> Outcome<u64, Error> {
        let table = record.table_name();
        let fields = record.field_infos();
        let primary_key = record.primary_key_columns();
        let auto = auto_increment_column(primary_key, fields);
        let values = record.values();

        let mut columns = Vec::new();
        let mut row = Vec::new();
        for field in fields.iter().filter(|f| f.is_insertable()) {
            if omit.iter().any(|c| c == field.column_name) {
                continue;
            }
            let value = value_of(&values, field.column_name);
            if Some(field.column_name) == auto && value.is_zero() {
                continue;
            }
            columns.push(field.column_name);
            row.push(value);
        }

        let dialect = self.conn.dialect();
        let mut builder = InsertBuilder::new(table).columns(columns).row(row);
        if let Some(action) = on_conflict {
            builder = builder
                .on_conflict(action.clone())
                .conflict_target(primary_key.iter().copied());
        }

        let backfill = auto.filter(|c| record.column_value(c).is_zero());
        match backfill {
            Some(column) if dialect.supports_returning() => {
                let stmt = try_result!(builder.returning(column).build(dialect));
                let rows = try_outcome!(self.run_query(cx, &stmt, Operation::Insert, table).await);
                if let Some(id) = rows.first().and_then(|r| r.get(0)) {
                    try_result!(record.assign(column, id.clone()));
                }
                Outcome::Ok(rows.len() as u64)
            }
            Some(column) => {
                let stmt = try_result!(builder.build(dialect));
                let id = try_outcome!(self.run_insert(cx, &stmt, table).await);
                if id > 0 {
                    try_result!(record.assign(column, Value::BigInt(id)));
                    Outcome::Ok(1)
                } else {
                    Outcome::Ok(0)
                }
            }
            None => {
                let stmt = try_result!(builder.build(dialect));
                self.run_execute(cx, &stmt, Operation::Insert, table).await
            }
        }
    }

    /// Insert records in batches of `SessionConfig::create_batch_size`.
    pub async fn create_many<M: Hooks>(&mut self, cx: &Cx, records: &mut [M]) -> Outcome<u64, Error> {
        let size = self.config.create_batch_size;
        self.create_batches(cx, records, size, &WriteOptions::default())
            .await
    }

    /// Insert records with one multi-row INSERT per `batch_size` records.
    ///
    /// All batches commit or roll back together. Returns the rows affected
    /// across every batch. Associations are not saved.
    #[tracing::instrument(level = "debug", skip(self, cx, records), fields(table = M::TABLE_NAME, count = records.len()))]
    pub async fn create_in_batches<M: Hooks>(
        &mut self,
        cx: &Cx,
        records: &mut [M],
        batch_size: usize,
    ) -> Outcome<u64, Error> {
        self.create_batches(cx, records, batch_size, &WriteOptions::default())
            .await
    }

    pub async fn create_many_with<M: Hooks>(
        &mut self,
        cx: &Cx,
        records: &mut [M],
        options: &WriteOptions,
    ) -> Outcome<u64, Error> {
        let size = self.config.create_batch_size;
        self.create_batches(cx, records, size, options).await
    }

    async fn create_batches<M: Hooks>(
        &mut self,
        cx: &Cx,
        records: &mut [M],
        batch_size: usize,
        options: &WriteOptions,
    ) -> Outcome<u64, Error> {
        if records.is_empty() {
            return Outcome::Ok(0);
        }
        self.write_scope(cx, async |s| {
            s.insert_batches(cx, records, batch_size.max(1), options)
                .await
        })
        .await
    }

    async fn insert_batches<M: Hooks>(
        &self,
        cx: &Cx,
        records: &mut [M],
        batch_size: usize,
        options: &WriteOptions,
    ) -> Outcome<u64, Error> {
        let descriptor = try_result!(describe::<M>());
        let ctx = self.hook_context(cx, Operation::Insert, M::TABLE_NAME);
        for record in records.iter_mut() {
            try_outcome!(record.before_create(&ctx).await);
            try_result!(stamp_times(record, ctx.now_nanos, true));
        }

        let dialect = self.conn.dialect();
        let auto = descriptor.auto_increment_column();
        let mut total = 0u64;
        for chunk in records.chunks_mut(batch_size) {
            let unset: Vec<bool> = chunk
                .iter()
                .map(|r| auto.is_some_and(|c| r.column_value(c).is_zero()))
                .collect();
            let all_unset = unset.iter().all(|u| *u);
            let columns: Vec<&'static str> = descriptor
                .columns()
                .map(|f| f.column_name)
                .filter(|c| !options.omits(c) && !(all_unset && Some(*c) == auto))
                .collect();

            let mut builder = InsertBuilder::new(M::TABLE_NAME).columns(columns.iter().copied());
            for record in chunk.iter() {
                let values = record.to_row();
                let row = columns
                    .iter()
                    .map(|c| match value_of(&values, c) {
                        v if Some(*c) == auto && v.is_zero() => Value::Default,
                        v => v,
                    })
                    .collect();
                builder = builder.row(row);
            }
            if let Some(action) = &options.on_conflict {
                builder = builder
                    .on_conflict(action.clone())
                    .conflict_target(M::PRIMARY_KEY.iter().copied());
            }

            match auto.filter(|_| unset.iter().any(|u| *u)) {
                Some(column) if dialect.supports_returning() => {
                    let stmt = try_result!(builder.returning(column).build(dialect));
                    let rows = try_outcome!(
                        self.run_query(cx, &stmt, Operation::Insert, M::TABLE_NAME)
                            .await
                    );
                    // Conflicting rows return nothing, so ids only line up
                    // when every row was inserted.
                    if rows.len() == chunk.len() {
                        for ((record, row), unset) in chunk.iter_mut().zip(&rows).zip(&unset) {
                            if let (true, Some(id)) = (*unset, row.get(0)) {
                                try_result!(record.set_column(column, id.clone()));
                            }
                        }
                    }
                    total += rows.len() as u64;
                }
                // Ids follow the first insert id only when no row can be
                // skipped or updated instead; conflicts report affected rows.
                Some(column) if options.on_conflict.is_none() => {
                    let stmt = try_result!(builder.build(dialect));
                    let first = try_outcome!(self.run_insert(cx, &stmt, M::TABLE_NAME).await);
                    let mut next = first;
                    for (record, unset) in chunk.iter_mut().zip(&unset) {
                        if *unset {
                            try_result!(record.set_column(column, Value::BigInt(next)));
                            next += 1;
                        }
                    }
                    total += chunk.len() as u64;
                }
                _ => {
                    let stmt = try_result!(builder.build(dialect));
                    total += try_outcome!(
                        self.run_execute(cx, &stmt, Operation::Insert, M::TABLE_NAME)
                            .await
                    );
                }
            }
        }

        for record in records.iter_mut() {
            try_outcome!(record.after_create(&ctx).await);
        }
        Outcome::Ok(total)
    }

    // ========================================================================
    // Save / update
    // ========================================================================

    /// Insert or update depending on the primary key.
    ///
    /// A zero auto-increment key inserts; a set one updates every updatable
    /// column. A caller-assigned key, zero included, is checked for existence
    /// first. The UPDATE ignores soft deletion, like the existence check, and
    /// falls back to an INSERT when it matches no row.
    #[tracing::instrument(level = "debug", skip_all, fields(table = M::TABLE_NAME))]
    pub async fn save<M: Hooks>(&mut self, cx: &Cx, record: &mut M) -> Outcome<(), Error> {
        let descriptor = try_result!(describe::<M>());
        match descriptor.auto_increment_column() {
            Some(column) if record.column_value(column).is_zero() => {
                return self.create(cx, record).await;
            }
            Some(_) => {}
            None => {
                let key = try_result!(key_condition(record));
                let found = try_outcome!(
                    self.count(cx, Query::<M>::new().unscoped().filter_by(key))
                        .await
                );
                if found == 0 {
                    return self.create(cx, record).await;
                }
            }
        }
        self.write_scope(cx, async |s| {
            match try_outcome!(s.update_by_key(cx, record, true).await) {
                Some(0) => {
                    tracing::debug!("saved key matched no row, inserting");
                    s.create_record(cx, record, &WriteOptions::default()).await
                }
                _ => Outcome::Ok(()),
            }
        })
        .await
    }

    /// Update one record by primary key with its non-zero updatable fields.
    #[tracing::instrument(level = "debug", skip_all, fields(table = M::TABLE_NAME))]
    pub async fn update_record<M: Hooks>(&mut self, cx: &Cx, record: &mut M) -> Outcome<u64, Error> {
        self.write_scope(cx, async |s| {
            s.update_by_key(cx, record, false)
                .await
                .map(Option::unwrap_or_default)
        })
        .await
    }

    /// UPDATE by key; `None` when there was nothing to assign.
    ///
    /// `full_row` writes every updatable column and reaches soft-deleted
    /// rows; otherwise only non-zero fields of live rows are written.
    async fn update_by_key<M: Hooks>(
        &self,
        cx: &Cx,
        record: &mut M,
        full_row: bool,
    ) -> Outcome<Option<u64>, Error> {
        let key = try_result!(key_condition(record));
        let ctx = self.hook_context(cx, Operation::Update, M::TABLE_NAME);
        try_outcome!(record.before_update(&ctx).await);
        try_result!(stamp_times(record, ctx.now_nanos, false));

        let assignments = if full_row {
            let fields = M::fields();
            Assignments::from_map(record.to_row().into_iter().filter(|(column, _)| {
                fields
                    .iter()
                    .any(|f| f.column_name == *column && f.is_updatable())
            }))
        } else {
            Assignments::from_record(record)
        };
        if assignments.is_empty() {
            try_outcome!(record.after_update(&ctx).await);
            return Outcome::Ok(None);
        }

        let query = if full_row {
            Query::<M>::new().unscoped()
        } else {
            Query::<M>::new()
        };
        let stmt = try_result!(
            query
                .filter_by(key)
                .build_update(self.conn.dialect(), &assignments)
        );
        let affected = try_outcome!(
            self.run_execute(cx, &stmt, Operation::Update, M::TABLE_NAME)
                .await
        );
        try_outcome!(record.after_update(&ctx).await);
        Outcome::Ok(Some(affected))
    }

    /// Bulk UPDATE of the rows `query` matches.
    ///
    /// Auto-update timestamp columns are set to now unless assigned
    /// explicitly. Fails with `MissingWhereClause` when the query has no
    /// condition.
    #[tracing::instrument(level = "debug", skip_all, fields(table = M::TABLE_NAME))]
    pub async fn updates<M: Model>(
        &mut self,
        cx: &Cx,
        query: Query<M>,
        assignments: Assignments,
    ) -> Outcome<u64, Error> {
        let now = now_nanos();
        let mut assignments = assignments;
        for field in M::fields() {
            if let Some(unit) = field.auto_update_time {
                if !assignments.contains(field.column_name) {
                    assignments = assignments.set(field.column_name, unit.value_at(now));
                }
            }
        }
        let stmt = try_result!(query.build_update(self.conn.dialect(), &assignments));
        let table = query.table_name().to_string();
        self.write_scope(cx, async |s| {
            s.run_execute(cx, &stmt, Operation::Update, &table).await
        })
        .await
    }

    /// Set one column on the rows `query` matches.
    pub async fn update<M: Model>(
        &mut self,
        cx: &Cx,
        query: Query<M>,
        column: &str,
        value: impl Into<Value>,
    ) -> Outcome<u64, Error> {
        self.updates(cx, query, Assignments::new().set(column, value))
            .await
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Delete one record by key; soft when the record type has a
    /// soft-delete column.
    #[tracing::instrument(level = "debug", skip_all, fields(table = M::TABLE_NAME))]
    pub async fn delete<M: Hooks>(&mut self, cx: &Cx, record: &mut M) -> Outcome<u64, Error> {
        self.write_scope(cx, async |s| s.delete_by_key(cx, record, false).await)
            .await
    }

    /// Permanently delete one record, ignoring soft deletion.
    pub async fn hard_delete<M: Hooks>(&mut self, cx: &Cx, record: &mut M) -> Outcome<u64, Error> {
        self.write_scope(cx, async |s| s.delete_by_key(cx, record, true).await)
            .await
    }

    async fn delete_by_key<M: Hooks>(
        &self,
        cx: &Cx,
        record: &mut M,
        hard: bool,
    ) -> Outcome<u64, Error> {
        let descriptor = try_result!(describe::<M>());
        let key = try_result!(key_condition(record));
        let ctx = self.hook_context(cx, Operation::Delete, M::TABLE_NAME);
        try_outcome!(record.before_delete(&ctx).await);

        let dialect = self.conn.dialect();
        let affected = match descriptor.soft_delete {
            Some((column, unit)) if !hard => {
                let deleted_at = unit.value_at(ctx.now_nanos);
                let stmt = try_result!(
                    Query::<M>::new()
                        .filter_by(key)
                        .build_soft_delete(dialect, deleted_at.clone())
                );
                let affected = try_outcome!(
                    self.run_execute(cx, &stmt, Operation::Delete, M::TABLE_NAME)
                        .await
                );
                try_result!(record.set_column(column, deleted_at));
                affected
            }
            _ => {
                let stmt = try_result!(
                    Query::<M>::new()
                        .unscoped()
                        .filter_by(key)
                        .build_delete(dialect)
                );
                try_outcome!(
                    self.run_execute(cx, &stmt, Operation::Delete, M::TABLE_NAME)
                        .await
                )
            }
        };

        try_outcome!(record.after_delete(&ctx).await);
        Outcome::Ok(affected)
    }

    /// Delete the rows `query` matches: soft unless the query is unscoped or
    /// the record type has no soft-delete column.
    pub async fn delete_where<M: Model>(&mut self, cx: &Cx, query: Query<M>) -> Outcome<u64, Error> {
        let descriptor = try_result!(describe::<M>());
        let dialect = self.conn.dialect();
        let stmt = match descriptor.soft_delete {
            Some((_, unit)) if !query.is_unscoped() => {
                try_result!(query.build_soft_delete(dialect, unit.value_at(now_nanos())))
            }
            _ => try_result!(query.build_delete(dialect)),
        };
        let table = query.table_name().to_string();
        self.write_scope(cx, async |s| {
            s.run_execute(cx, &stmt, Operation::Delete, &table).await
        })
        .await
    }

    // ========================================================================
    // Raw writes
    // ========================================================================

    /// Execute raw SQL with `?` placeholders; returns rows affected.
    pub async fn exec(&self, cx: &Cx, sql: &str, params: Vec<Value>) -> Outcome<u64, Error> {
        let mut w = SqlWriter::new(self.conn.dialect());
        let rendered = try_result!(w.fragment(sql, &params));
        let stmt = w.finish(rendered);
        self.run_execute(cx, &stmt, Operation::Raw, "raw").await
    }

    /// Insert one row built from a column map into `table`.
    pub async fn insert_map<I, K, V>(&self, cx: &Cx, table: &str, entries: I) -> Outcome<u64, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let sorted: BTreeMap<String, Value> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let (columns, row): (Vec<String>, Vec<Value>) = sorted.into_iter().unzip();
        let stmt = try_result!(
            InsertBuilder::new(table)
                .columns(columns)
                .row(row)
                .build(self.conn.dialect())
        );
        self.run_execute(cx, &stmt, Operation::Insert, table).await
    }
}
