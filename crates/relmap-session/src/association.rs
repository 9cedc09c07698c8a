//! Explicit mutation of one owner's relationship.

use std::collections::HashSet;

use asupersync::{Cx, Outcome};
use relmap_core::{
    AssociationErrorKind, Connection, DynModel, Error, Hooks, Model, Operation, RelationshipInfo,
    RelationshipKind, Result, Value, key_hash, try_outcome, try_result,
};
use relmap_query::{
    Assignments, InsertBuilder, OnConflict, Query, SelectSpec, Target, build_delete, build_update,
};

use crate::Session;
use crate::lifecycle::{WriteOptions, key_condition};

/// Handle on one owner record and one of its relationships.
///
/// Created with [`Session::association`]. Every operation fails with an
/// `OwnerKeyMissing` association error while the owner has no primary key.
pub struct Association<'s, C: Connection, M: Model> {
    session: &'s mut Session<C>,
    owner: &'s mut M,
    rel: &'static RelationshipInfo,
}

impl<C: Connection> Session<C> {
    /// Open the relationship `name` of `owner` for querying and mutation.
    pub fn association<'s, M: Model>(
        &'s mut self,
        owner: &'s mut M,
        name: &str,
    ) -> Result<Association<'s, C, M>> {
        let rel = M::RELATIONSHIPS
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| {
                Error::association(
                    AssociationErrorKind::UnknownRelationship,
                    std::any::type_name::<M>(),
                    name,
                    format!("{} declares no relationship named '{name}'", M::TABLE_NAME),
                )
            })?;
        Ok(Association {
            session: self,
            owner,
            rel,
        })
    }
}

fn check_owner<M: Model>(owner: &M, rel: &RelationshipInfo) -> Result<Value> {
    if owner.primary_key_value().iter().any(Value::is_zero) {
        return Err(Error::association(
            AssociationErrorKind::OwnerKeyMissing,
            std::any::type_name::<M>(),
            rel.name,
            "owner record has no primary key value",
        ));
    }
    Ok(owner.column_value(rel.local_key))
}

fn check_related<M: Model, T: Model>(rel: &RelationshipInfo) -> Result<()> {
    if rel.related.type_name() == std::any::type_name::<T>() {
        return Ok(());
    }
    Err(Error::association(
        AssociationErrorKind::TypeMismatch,
        std::any::type_name::<M>(),
        rel.name,
        format!(
            "relationship holds {}, got {}",
            rel.related.type_name(),
            std::any::type_name::<T>()
        ),
    ))
}

/// Condition restricting the related table to rows linked to `owner_key`.
fn scope(
    session: &Session<impl Connection>,
    rel: &RelationshipInfo,
    owner_key: Value,
) -> (String, Vec<Value>) {
    let dialect = session.connection().dialect();
    let remote = dialect.qualified(rel.related.table, rel.remote_key);
    match (rel.kind, rel.link_table) {
        (RelationshipKind::ManyToMany, Some(link)) => (
            format!(
                "{remote} IN (SELECT {} FROM {} WHERE {} = ?)",
                dialect.qualified(link.table_name, link.remote_column),
                dialect.quote_identifier(link.table_name),
                dialect.qualified(link.table_name, link.local_column),
            ),
            vec![owner_key],
        ),
        _ => (format!("{remote} = ?"), vec![owner_key]),
    }
}

/// Replace the owner's in-memory related records with the kept ones plus `added`.
fn refresh<M: Model>(
    owner: &mut M,
    rel: &RelationshipInfo,
    keep: impl Fn(&dyn DynModel) -> bool,
    added: Vec<Box<dyn DynModel>>,
) -> Result<()> {
    let mut current: Vec<Box<dyn DynModel>> = owner
        .associations_mut(rel.name)
        .into_iter()
        .filter(|r| !rel.is_single() && keep(&**r))
        .map(|r| r.clone_boxed())
        .collect();
    current.extend(added);
    owner.attach_related(rel.name, current)
}

/// Column identifying a related record when unlinking it.
fn identity_column(rel: &RelationshipInfo) -> &'static str {
    match rel.kind {
        RelationshipKind::HasOne | RelationshipKind::HasMany => rel
            .related
            .primary_key
            .first()
            .copied()
            .unwrap_or(rel.remote_key),
        RelationshipKind::BelongsTo | RelationshipKind::ManyToMany => rel.remote_key,
    }
}

fn link_target(table: &str) -> Target<'_> {
    Target {
        table,
        primary_key: &[],
        fields: &[],
        relationships: &[],
        soft_delete: None,
    }
}

impl<C: Connection, M: Model> Association<'_, C, M> {
    pub fn relationship(&self) -> &'static RelationshipInfo {
        self.rel
    }

    /// Related records matching `query`, restricted to this owner.
    pub async fn find<T: Hooks>(&self, cx: &Cx, query: Query<T>) -> Outcome<Vec<T>, Error> {
        try_result!(check_related::<M, T>(self.rel));
        let key = try_result!(check_owner(&*self.owner, self.rel));
        if key.is_zero() {
            return Outcome::Ok(Vec::new());
        }
        let (fragment, params) = scope(&*self.session, self.rel, key);
        self.session.find(cx, query.filter(fragment, params)).await
    }

    pub async fn count(&self, cx: &Cx) -> Outcome<i64, Error> {
        let key = try_result!(check_owner(&*self.owner, self.rel));
        if key.is_zero() {
            return Outcome::Ok(0);
        }
        let (fragment, params) = scope(&*self.session, self.rel, key);
        let target = Target::related(&self.rel.related);
        let stmt = try_result!(
            SelectSpec::new()
                .filter(fragment, params)
                .build_count(self.session.connection().dialect(), &target)
        );
        let rows = try_outcome!(
            self.session
                .run_query(cx, &stmt, Operation::Count, target.table)
                .await
        );
        Outcome::Ok(
            rows.first()
                .and_then(|r| r.get(0))
                .and_then(Value::as_i64)
                .unwrap_or(0),
        )
    }

    /// Link `records` to the owner, inserting those without a key.
    ///
    /// For a belongs-to relationship the owner's foreign key is pointed at
    /// the first record.
    #[tracing::instrument(level = "debug", skip_all, fields(relationship = self.rel.name))]
    pub async fn append<T: Hooks>(&mut self, cx: &Cx, records: &mut [T]) -> Outcome<(), Error> {
        try_result!(check_related::<M, T>(self.rel));
        try_result!(check_owner(&*self.owner, self.rel));
        let rel = self.rel;
        let owner = &mut *self.owner;
        self.session
            .write_scope(cx, async |s| append_in(s, cx, owner, rel, records).await)
            .await
    }

    /// Clear the relationship and link `records` instead, atomically.
    ///
    /// The owner in memory changes only once the store accepted both steps.
    #[tracing::instrument(level = "debug", skip_all, fields(relationship = self.rel.name))]
    pub async fn replace<T: Hooks>(&mut self, cx: &Cx, records: &mut [T]) -> Outcome<(), Error> {
        try_result!(check_related::<M, T>(self.rel));
        try_result!(check_owner(&*self.owner, self.rel));
        let rel = self.rel;
        let mut staged = self.owner.clone();
        try_outcome!(
            self.session
                .transaction(cx, async |s| {
                    try_outcome!(clear_in(s, cx, &mut staged, rel).await);
                    append_in(s, cx, &mut staged, rel, records).await
                })
                .await
        );
        *self.owner = staged;
        Outcome::Ok(())
    }

    /// Unlink `records` from the owner without deleting them.
    ///
    /// Foreign keys are set to NULL; many-to-many links lose their join rows.
    pub async fn delete<T: Model>(&mut self, cx: &Cx, records: &[T]) -> Outcome<u64, Error> {
        try_result!(check_related::<M, T>(self.rel));
        let key = try_result!(check_owner(&*self.owner, self.rel));
        if records.is_empty() {
            return Outcome::Ok(0);
        }
        let rel = self.rel;
        let owner = &mut *self.owner;
        let id_column = identity_column(rel);
        let related_keys: Vec<Value> = records.iter().map(|r| r.column_value(id_column)).collect();
        let removed: HashSet<u64> = related_keys
            .iter()
            .map(|k| key_hash(std::slice::from_ref(k)))
            .collect();

        let affected = try_outcome!(
            self.session
                .write_scope(cx, async |s| {
                    unlink(s, cx, owner, rel, key.clone(), Some(related_keys.clone())).await
                })
                .await
        );
        try_result!(refresh(
            owner,
            rel,
            |r| !removed.contains(&key_hash(&[r.column_value(id_column)])),
            Vec::new(),
        ));
        Outcome::Ok(affected)
    }

    /// Unlink every related record from the owner.
    pub async fn clear(&mut self, cx: &Cx) -> Outcome<u64, Error> {
        try_result!(check_owner(&*self.owner, self.rel));
        let rel = self.rel;
        let owner = &mut *self.owner;
        self.session
            .write_scope(cx, async |s| clear_in(s, cx, owner, rel).await)
            .await
    }
}

async fn clear_in<C: Connection, M: Model>(
    session: &Session<C>,
    cx: &Cx,
    owner: &mut M,
    rel: &'static RelationshipInfo,
) -> Outcome<u64, Error> {
    let key = owner.column_value(rel.local_key);
    let affected = try_outcome!(unlink(session, cx, owner, rel, key, None).await);
    try_result!(refresh(owner, rel, |_| false, Vec::new()));
    Outcome::Ok(affected)
}

/// Remove links from the store. `related_keys` of `None` unlinks everything.
async fn unlink<C: Connection, M: Model>(
    session: &Session<C>,
    cx: &Cx,
    owner: &mut M,
    rel: &'static RelationshipInfo,
    owner_key: Value,
    related_keys: Option<Vec<Value>>,
) -> Outcome<u64, Error> {
    let dialect = session.connection().dialect();
    match (rel.kind, rel.link_table) {
        (RelationshipKind::BelongsTo, _) => {
            if owner_key.is_zero() {
                return Outcome::Ok(0);
            }
            if let Some(keys) = &related_keys {
                let hash = key_hash(std::slice::from_ref(&owner_key));
                if !keys.iter().any(|k| key_hash(std::slice::from_ref(k)) == hash) {
                    return Outcome::Ok(0);
                }
            }
            let key = try_result!(key_condition(&*owner));
            let stmt = try_result!(
                Query::<M>::new()
                    .unscoped()
                    .filter_by(key)
                    .build_update(dialect, &Assignments::new().set(rel.local_key, Value::Null))
            );
            let affected = try_outcome!(
                session
                    .run_execute(cx, &stmt, Operation::Association, M::TABLE_NAME)
                    .await
            );
            try_result!(owner.set_column(rel.local_key, Value::Null));
            Outcome::Ok(affected)
        }
        (RelationshipKind::ManyToMany, Some(link)) => {
            let local = dialect.qualified(link.table_name, link.local_column);
            let spec = match related_keys {
                Some(keys) => SelectSpec::new().filter(
                    format!(
                        "{local} = ? AND {} IN (?)",
                        dialect.qualified(link.table_name, link.remote_column)
                    ),
                    vec![owner_key, Value::Array(keys)],
                ),
                None => SelectSpec::new().filter(format!("{local} = ?"), vec![owner_key]),
            };
            let stmt = try_result!(build_delete(&spec, &link_target(link.table_name), dialect));
            session
                .run_execute(cx, &stmt, Operation::Association, link.table_name)
                .await
        }
        _ => {
            let target = Target::related(&rel.related);
            let remote = dialect.qualified(target.table, rel.remote_key);
            let mut spec = SelectSpec::new()
                .unscoped()
                .filter(format!("{remote} = ?"), vec![owner_key]);
            if let Some(keys) = related_keys {
                let column = dialect.qualified(target.table, identity_column(rel));
                spec = spec.filter(format!("{column} IN (?)"), vec![Value::Array(keys)]);
            }
            let stmt = try_result!(build_update(
                &spec,
                &target,
                dialect,
                &Assignments::new().set(rel.remote_key, Value::Null),
            ));
            session
                .run_execute(cx, &stmt, Operation::Association, target.table)
                .await
        }
    }
}

async fn append_in<C: Connection, M: Model, T: Hooks>(
    session: &Session<C>,
    cx: &Cx,
    owner: &mut M,
    rel: &'static RelationshipInfo,
    records: &mut [T],
) -> Outcome<(), Error> {
    let dialect = session.connection().dialect();
    let owner_key = owner.column_value(rel.local_key);
    let plain = WriteOptions::new().omit_associations();

    match (rel.kind, rel.link_table) {
        (RelationshipKind::BelongsTo, _) => {
            let Some(parent) = records.first_mut() else {
                return Outcome::Ok(());
            };
            if parent.primary_key_value().iter().all(Value::is_zero) {
                try_outcome!(session.create_record(cx, parent, &plain).await);
            }
            let target_key = parent.column_value(rel.remote_key);
            let key = try_result!(key_condition(&*owner));
            let stmt = try_result!(
                Query::<M>::new()
                    .unscoped()
                    .filter_by(key)
                    .build_update(dialect, &Assignments::new().set(rel.local_key, target_key.clone()))
            );
            try_outcome!(
                session
                    .run_execute(cx, &stmt, Operation::Association, M::TABLE_NAME)
                    .await
            );
            try_result!(owner.set_column(rel.local_key, target_key));
        }
        (RelationshipKind::ManyToMany, Some(link)) => {
            for record in records.iter_mut() {
                if record.primary_key_value().iter().all(Value::is_zero) {
                    try_outcome!(session.create_record(cx, record, &plain).await);
                }
                let stmt = try_result!(
                    InsertBuilder::new(link.table_name)
                        .columns([link.local_column, link.remote_column])
                        .row(vec![owner_key.clone(), record.column_value(rel.remote_key)])
                        .on_conflict(OnConflict::DoNothing)
                        .conflict_target([link.local_column, link.remote_column])
                        .build(dialect)
                );
                try_outcome!(
                    session
                        .run_execute(cx, &stmt, Operation::Association, link.table_name)
                        .await
                );
            }
        }
        _ => {
            for record in records.iter_mut() {
                try_result!(record.set_column(rel.remote_key, owner_key.clone()));
                if record.primary_key_value().iter().all(Value::is_zero) {
                    try_outcome!(session.create_record(cx, record, &plain).await);
                    continue;
                }
                let key = try_result!(key_condition(&*record));
                let stmt = try_result!(
                    Query::<T>::new().filter_by(key).build_update(
                        dialect,
                        &Assignments::new().set(rel.remote_key, owner_key.clone())
                    )
                );
                try_outcome!(
                    session
                        .run_execute(cx, &stmt, Operation::Association, T::TABLE_NAME)
                        .await
                );
            }
        }
    }

    let added: Vec<Box<dyn DynModel>> = records
        .iter()
        .take(if rel.is_single() { 1 } else { records.len() })
        .map(|r| Box::new(r.clone()) as Box<dyn DynModel>)
        .collect();
    tracing::debug!(relationship = rel.name, appended = added.len(), "association appended");
    try_result!(refresh(owner, rel, |_| true, added));
    Outcome::Ok(())
}
