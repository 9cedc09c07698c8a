//! Typed query specification.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use relmap_core::{Dialect, Model, Result, Value, describe};

use crate::builder::{self, Assignments};
use crate::clause::{LockMode, OrderBy};
use crate::condition::Condition;
use crate::join::JoinRequest;
use crate::select::{BuiltSelect, SelectSpec, Target};
use crate::writer::Statement;

/// A deferred query transformer, applied when the query is executed.
pub type Scope<M> = Arc<dyn Fn(Query<M>) -> Query<M> + Send + Sync>;

/// One eager-load request.
#[derive(Debug, Clone, PartialEq)]
pub struct PreloadRequest {
    /// Relationship path, segments separated by `.` (e.g. `"Orders.Items"`).
    pub path: String,
    /// Extra condition for the last segment's query.
    pub condition: Option<(String, Vec<Value>)>,
}

impl PreloadRequest {
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('.').filter(|s| !s.is_empty())
    }
}

/// A query over records of type `M`.
///
/// Builder methods consume and return the query. It is `Clone`, so a base
/// query can be reused without one chain affecting another:
///
/// ```ignore
/// let adults = Query::<User>::new().filter("age >= ?", vec![18.into()]);
/// let page = adults.clone().order("id asc").limit(5).offset(5);
/// let named = adults.filter_by(Condition::from_map([("name", "jinzhu")]));
/// ```
pub struct Query<M: Model> {
    spec: SelectSpec,
    table: Option<String>,
    scopes: Vec<Scope<M>>,
    preloads: Vec<PreloadRequest>,
    preload_all: bool,
    _marker: PhantomData<fn() -> M>,
}

impl<M: Model> Clone for Query<M> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            table: self.table.clone(),
            scopes: self.scopes.clone(),
            preloads: self.preloads.clone(),
            preload_all: self.preload_all,
            _marker: PhantomData,
        }
    }
}

impl<M: Model> fmt::Debug for Query<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table.as_deref().unwrap_or(M::TABLE_NAME))
            .field("spec", &self.spec)
            .field("scopes", &self.scopes.len())
            .field("preloads", &self.preloads)
            .field("preload_all", &self.preload_all)
            .finish()
    }
}

impl<M: Model> Default for Query<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> Query<M> {
    pub fn new() -> Self {
        Self {
            spec: SelectSpec::new(),
            table: None,
            scopes: Vec::new(),
            preloads: Vec::new(),
            preload_all: false,
            _marker: PhantomData,
        }
    }

    fn map_spec(mut self, f: impl FnOnce(SelectSpec) -> SelectSpec) -> Self {
        self.spec = f(self.spec);
        self
    }

    /// AND a raw condition with `?` placeholders.
    pub fn filter(self, fragment: impl Into<String>, params: Vec<Value>) -> Self {
        self.map_spec(|s| s.filter(fragment, params))
    }

    /// OR a raw condition against everything accumulated so far.
    pub fn or_filter(self, fragment: impl Into<String>, params: Vec<Value>) -> Self {
        self.map_spec(|s| s.or_filter(fragment, params))
    }

    /// AND the negation of a raw condition.
    pub fn not_filter(self, fragment: impl Into<String>, params: Vec<Value>) -> Self {
        self.map_spec(|s| s.not_filter(fragment, params))
    }

    pub fn filter_by(self, condition: Condition) -> Self {
        self.map_spec(|s| s.filter_by(condition))
    }

    pub fn or_by(self, condition: Condition) -> Self {
        self.map_spec(|s| s.or_by(condition))
    }

    pub fn not_by(self, condition: Condition) -> Self {
        self.map_spec(|s| s.not_by(condition))
    }

    /// Restrict the projection. Columns left out decode to their zero value.
    pub fn select<I, S>(self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.map_spec(|s| s.select(columns))
    }

    pub fn order(self, order: impl Into<OrderBy>) -> Self {
        self.map_spec(|s| s.order(order))
    }

    pub fn limit(self, n: u64) -> Self {
        self.map_spec(|s| s.limit(n))
    }

    pub fn offset(self, n: u64) -> Self {
        self.map_spec(|s| s.offset(n))
    }

    pub fn group(self, expr: impl Into<String>) -> Self {
        self.map_spec(|s| s.group(expr))
    }

    pub fn having(self, fragment: impl Into<String>, params: Vec<Value>) -> Self {
        self.map_spec(|s| s.having(fragment, params))
    }

    pub fn distinct(self) -> Self {
        self.map_spec(SelectSpec::distinct)
    }

    /// Lock matched rows; only valid inside an active transaction.
    pub fn lock(self, mode: LockMode) -> Self {
        self.map_spec(|s| s.lock(mode))
    }

    pub fn for_update(self) -> Self {
        self.lock(LockMode::Update)
    }

    /// Add a transformer applied at execution time, after the chain's own terms.
    pub fn scopes<F>(mut self, scope: F) -> Self
    where
        F: Fn(Query<M>) -> Query<M> + Send + Sync + 'static,
    {
        self.scopes.push(Arc::new(scope));
        self
    }

    /// Disable the implicit soft-delete filter.
    pub fn unscoped(self) -> Self {
        self.map_spec(SelectSpec::unscoped)
    }

    /// Eager-load a relationship path with one query per segment.
    pub fn preload(mut self, path: impl Into<String>) -> Self {
        self.preloads.push(PreloadRequest {
            path: path.into(),
            condition: None,
        });
        self
    }

    /// Eager-load with a condition applied to the relationship's query.
    pub fn preload_with(
        mut self,
        path: impl Into<String>,
        fragment: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        self.preloads.push(PreloadRequest {
            path: path.into(),
            condition: Some((fragment.into(), params)),
        });
        self
    }

    /// Eager-load every top-level relationship.
    pub fn preload_all(mut self) -> Self {
        self.preload_all = true;
        self
    }

    /// Join a relationship by name, or pass raw join SQL with parameters.
    pub fn joins(self, name_or_sql: impl Into<String>, params: Vec<Value>) -> Self {
        let request = JoinRequest::Named {
            target: name_or_sql.into(),
            params,
        };
        self.map_spec(|s| s.join(request))
    }

    /// Join a relationship with an extra ON condition.
    pub fn joins_with(
        self,
        relation: impl Into<String>,
        fragment: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        let request = JoinRequest::Relation {
            name: relation.into(),
            fragment: fragment.into(),
            params,
        };
        self.map_spec(|s| s.join(request))
    }

    /// Read from or write to another table with the same columns.
    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.table = Some(name.into());
        self
    }

    /// Apply deferred scopes. Scopes added by a scope are not applied again.
    pub fn resolve(mut self) -> Self {
        let scopes = std::mem::take(&mut self.scopes);
        for scope in &scopes {
            self = scope(self);
        }
        self
    }

    pub fn spec(&self) -> &SelectSpec {
        &self.spec
    }

    pub fn preloads(&self) -> &[PreloadRequest] {
        &self.preloads
    }

    pub fn wants_all_preloads(&self) -> bool {
        self.preload_all
    }

    pub fn lock_mode(&self) -> Option<LockMode> {
        self.spec.lock_mode()
    }

    pub fn is_unscoped(&self) -> bool {
        self.spec.is_unscoped()
    }

    pub fn has_conditions(&self) -> bool {
        self.spec.has_conditions()
    }

    /// Table this query targets.
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(M::TABLE_NAME)
    }

    fn target(&self) -> Result<Target<'_>> {
        let descriptor = describe::<M>()?;
        Ok(Target::from_descriptor(descriptor).with_table(self.table_name()))
    }

    pub fn build_select(&self, dialect: Dialect) -> Result<BuiltSelect> {
        let query = self.clone().resolve();
        query.spec.build_select(dialect, &query.target()?)
    }

    pub fn build_count(&self, dialect: Dialect) -> Result<Statement> {
        let query = self.clone().resolve();
        query.spec.build_count(dialect, &query.target()?)
    }

    pub fn build_update(&self, dialect: Dialect, assignments: &Assignments) -> Result<Statement> {
        let query = self.clone().resolve();
        builder::build_update(&query.spec, &query.target()?, dialect, assignments)
    }

    pub fn build_delete(&self, dialect: Dialect) -> Result<Statement> {
        let query = self.clone().resolve();
        builder::build_delete(&query.spec, &query.target()?, dialect)
    }

    pub fn build_soft_delete(&self, dialect: Dialect, deleted_at: Value) -> Result<Statement> {
        let query = self.clone().resolve();
        builder::build_soft_delete(&query.spec, &query.target()?, dialect, deleted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{
        FieldInfo, LinkTableInfo, RelatedModel, RelationshipInfo, RelationshipKind, Row, SqlType,
        TimeUnit,
    };

    #[derive(Debug, Clone, Default)]
    struct Wallet {
        id: String,
        user_id: String,
        balance: i64,
    }

    impl Model for Wallet {
        const TABLE_NAME: &'static str = "wallets";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn fields() -> &'static [FieldInfo] {
            const FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id", "id", SqlType::VarChar(100)).primary_key(true),
                FieldInfo::new("user_id", "user_id", SqlType::VarChar(100)),
                FieldInfo::new("balance", "balance", SqlType::BigInt),
            ];
            FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("id", self.id.as_str().into()),
                ("user_id", self.user_id.as_str().into()),
                ("balance", self.balance.into()),
            ]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_or_default("id")?,
                user_id: row.get_or_default("user_id")?,
                balance: row.get_or_default("balance")?,
            })
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Tag {
        id: i64,
    }

    impl Model for Tag {
        const TABLE_NAME: &'static str = "tags";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];

        fn fields() -> &'static [FieldInfo] {
            const FIELDS: &[FieldInfo] =
                &[FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true)];
            FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into())]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_or_default("id")?,
            })
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Account {
        id: String,
        name: String,
        age: i32,
    }

    impl Model for Account {
        const TABLE_NAME: &'static str = "accounts";
        const PRIMARY_KEY: &'static [&'static str] = &["id"];
        const RELATIONSHIPS: &'static [RelationshipInfo] = &[
            RelationshipInfo::new(
                "Wallet",
                RelationshipKind::HasOne,
                RelatedModel::of::<Wallet>(),
            )
            .local_key("id")
            .remote_key("user_id"),
            RelationshipInfo::new("Tags", RelationshipKind::ManyToMany, RelatedModel::of::<Tag>())
                .local_key("id")
                .remote_key("id")
                .link(LinkTableInfo::new("account_tags", "account_id", "tag_id")),
        ];

        fn fields() -> &'static [FieldInfo] {
            const FIELDS: &[FieldInfo] = &[
                FieldInfo::new("id", "id", SqlType::VarChar(100)).primary_key(true),
                FieldInfo::new("name", "name", SqlType::Text),
                FieldInfo::new("age", "age", SqlType::Integer),
                FieldInfo::new("deleted_at", "deleted_at", SqlType::Timestamp)
                    .soft_delete(TimeUnit::Timestamp),
            ];
            FIELDS
        }

        fn to_row(&self) -> Vec<(&'static str, Value)> {
            vec![
                ("id", self.id.as_str().into()),
                ("name", self.name.as_str().into()),
                ("age", self.age.into()),
            ]
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_or_default("id")?,
                name: row.get_or_default("name")?,
                age: row.get_or_default("age")?,
            })
        }
    }

    #[test]
    fn struct_condition_matches_raw_equality() {
        let sample = Account {
            name: "jinzhu".into(),
            ..Account::default()
        };
        let by_struct = Query::<Account>::new()
            .filter_by(Condition::from_record(&sample))
            .build_select(Dialect::Postgres)
            .unwrap();
        let by_raw = Query::<Account>::new()
            .filter("\"accounts\".\"name\" = ?", vec!["jinzhu".into()])
            .build_select(Dialect::Postgres)
            .unwrap();
        assert_eq!(by_struct.statement, by_raw.statement);
    }

    #[test]
    fn chains_do_not_share_state() {
        let base = Query::<Account>::new().filter("age > ?", vec![Value::Int(18)]);
        let first = base.clone().filter("name = ?", vec!["a".into()]);
        let second = base.clone().order("id");
        assert_eq!(first.build_select(Dialect::Postgres).unwrap().statement.params.len(), 2);
        assert_eq!(second.build_select(Dialect::Postgres).unwrap().statement.params.len(), 1);
        assert_eq!(base.build_select(Dialect::Postgres).unwrap().statement.params.len(), 1);
    }

    #[test]
    fn scopes_apply_after_chain_terms() {
        let stmt = Query::<Account>::new()
            .scopes(|q| q.filter("age > ?", vec![Value::Int(20)]))
            .filter("name = ?", vec!["x".into()])
            .unscoped()
            .build_select(Dialect::Postgres)
            .unwrap()
            .statement;
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"accounts\" WHERE (name = $1) AND (age > $2)"
        );
    }

    #[test]
    fn relation_join_selects_aliased_columns() {
        let built = Query::<Account>::new()
            .joins("Wallet", Vec::new())
            .unscoped()
            .build_select(Dialect::Postgres)
            .unwrap();
        assert_eq!(
            built.statement.sql,
            "SELECT \"accounts\".\"id\", \"accounts\".\"name\", \"accounts\".\"age\", \
             \"accounts\".\"deleted_at\", \
             \"Wallet\".\"id\" AS \"Wallet__id\", \"Wallet\".\"user_id\" AS \"Wallet__user_id\", \
             \"Wallet\".\"balance\" AS \"Wallet__balance\" \
             FROM \"accounts\" LEFT JOIN \"wallets\" \"Wallet\" ON \"Wallet\".\"user_id\" = \"accounts\".\"id\""
        );
        assert_eq!(built.joined.len(), 1);
    }

    #[test]
    fn many_to_many_join_goes_through_join_table() {
        let built = Query::<Account>::new()
            .joins_with("Tags", "\"Tags\".\"id\" > ?", vec![Value::BigInt(3)])
            .unscoped()
            .build_select(Dialect::Postgres)
            .unwrap();
        assert!(built.statement.sql.contains(
            "LEFT JOIN \"account_tags\" \"Tags__join\" ON \"Tags__join\".\"account_id\" = \"accounts\".\"id\" \
             LEFT JOIN \"tags\" \"Tags\" ON \"Tags\".\"id\" = \"Tags__join\".\"tag_id\" AND (\"Tags\".\"id\" > $1)"
        ));
        assert!(
            Query::<Account>::new()
                .joins_with("Pets", "1 = 1", Vec::new())
                .build_select(Dialect::Postgres)
                .is_err()
        );
    }

    #[test]
    fn table_override_and_soft_delete_statements() {
        let q = Query::<Account>::new()
            .table("archived_accounts")
            .filter("id = ?", vec!["u1".into()]);
        let soft = q.build_soft_delete(Dialect::Postgres, Value::Timestamp(9)).unwrap();
        assert!(soft.sql.starts_with("UPDATE \"archived_accounts\" SET \"deleted_at\" = $1"));
        let hard = q.unscoped().build_delete(Dialect::Postgres).unwrap();
        assert_eq!(hard.sql, "DELETE FROM \"archived_accounts\" WHERE id = $1");
    }

    #[test]
    fn preload_paths_split_into_segments() {
        let q = Query::<Account>::new()
            .preload("Wallet")
            .preload_with("Orders.Items", "qty > ?", vec![Value::Int(1)]);
        let segments: Vec<Vec<&str>> = q.preloads().iter().map(|p| p.segments().collect()).collect();
        assert_eq!(segments, vec![vec!["Wallet"], vec!["Orders", "Items"]]);
    }
}
