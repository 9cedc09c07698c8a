//! Recording connection and sample records shared by this crate's tests.

use std::future::Future;
use std::sync::{Arc, Mutex};

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use relmap_core::{
    ConstraintError, ConstraintKind, Connection, Dialect, Error, FieldInfo, Hooks, LinkTableInfo,
    Model, RelatedModel, RelationshipInfo, RelationshipKind, Result, Row, SqlType, TimeUnit,
    Value, downcast_many, downcast_one,
};

#[derive(Debug, Default)]
struct MockState {
    statements: Vec<(String, Vec<Value>)>,
    responses: Vec<(String, Vec<Row>)>,
    failures: Vec<(String, ConstraintKind)>,
    affected: Vec<(String, u64)>,
    next_id: i64,
    discarded: bool,
}

/// Records every statement and answers queries from scripted rows.
///
/// Scripts match on a substring of the SQL; the first match wins.
#[derive(Debug, Clone)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
    dialect: Dialect,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::with_dialect(Dialect::Postgres)
    }

    pub fn with_dialect(dialect: Dialect) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            dialect,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("lock poisoned")
    }

    pub fn on_query(&self, pattern: &str, rows: Vec<Row>) {
        self.lock().responses.push((pattern.to_string(), rows));
    }

    pub fn on_execute(&self, pattern: &str, affected: u64) {
        self.lock().affected.push((pattern.to_string(), affected));
    }

    pub fn fail_execute_containing(&self, pattern: &str, kind: ConstraintKind) {
        self.lock().failures.push((pattern.to_string(), kind));
    }

    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().statements.clone()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.lock().statements.iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn was_discarded(&self) -> bool {
        self.lock().discarded
    }

    fn record(&self, sql: &str, params: &[Value]) -> std::result::Result<(), Error> {
        let mut state = self.lock();
        state.statements.push((sql.to_string(), params.to_vec()));
        match state.failures.iter().find(|(p, _)| sql.contains(p.as_str())) {
            Some((_, kind)) => Err(Error::Constraint(ConstraintError {
                kind: *kind,
                constraint: None,
                sqlstate: None,
                message: format!("violation in: {sql}"),
            })),
            None => Ok(()),
        }
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let outcome = match self.record(sql, params) {
            Ok(()) => Outcome::Ok(
                self.lock()
                    .responses
                    .iter()
                    .find(|(p, _)| sql.contains(p.as_str()))
                    .map(|(_, rows)| rows.clone())
                    .unwrap_or_default(),
            ),
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let outcome = match self.record(sql, params) {
            Ok(()) => Outcome::Ok(
                self.lock()
                    .affected
                    .iter()
                    .find(|(p, _)| sql.contains(p.as_str()))
                    .map_or(1, |(_, n)| *n),
            ),
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let outcome = match self.record(sql, params) {
            Ok(()) => {
                let mut state = self.lock();
                state.next_id += 1;
                Outcome::Ok(state.next_id)
            }
            Err(e) => Outcome::Err(e),
        };
        async move { outcome }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }

    fn discard(&self) {
        self.lock().discarded = true;
    }
}

pub fn block_on<F, Fut>(f: F)
where
    F: FnOnce(Cx) -> Fut,
    Fut: Future<Output = ()>,
{
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f(Cx::for_testing()));
}

pub fn expect_ok<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    Row::from_pairs(pairs.iter().map(|(k, v)| (*k, v.clone())))
}

// ============================================================================
// Sample records
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Company {
    pub id: i64,
    pub name: String,
}

impl Model for Company {
    const TABLE_NAME: &'static str = "companies";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("name", "name", SqlType::Text),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("name", self.name.as_str().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_or_default("id")?,
            name: row.get_or_default("name")?,
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.as_i64().unwrap_or_default(),
            "name" => self.name = value.as_str().unwrap_or_default().to_string(),
            _ => return Err(Error::Custom(format!("companies has no column {column}"))),
        }
        Ok(())
    }
}

impl Hooks for Company {}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pet {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
}

impl Model for Pet {
    const TABLE_NAME: &'static str = "pets";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("user_id", "user_id", SqlType::BigInt),
            FieldInfo::new("name", "name", SqlType::Text),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("user_id", self.user_id.into()),
            ("name", self.name.as_str().into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_or_default("id")?,
            user_id: row.get_or_default("user_id")?,
            name: row.get_or_default("name")?,
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.as_i64().unwrap_or_default(),
            "user_id" => self.user_id = value.as_i64().unwrap_or_default(),
            "name" => self.name = value.as_str().unwrap_or_default().to_string(),
            _ => return Err(Error::Custom(format!("pets has no column {column}"))),
        }
        Ok(())
    }
}

impl Hooks for Pet {}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Language {
    pub id: i64,
    pub code: String,
}

impl Model for Language {
    const TABLE_NAME: &'static str = "languages";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("code", "code", SqlType::Text),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("id", self.id.into()), ("code", self.code.as_str().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_or_default("id")?,
            code: row.get_or_default("code")?,
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.as_i64().unwrap_or_default(),
            "code" => self.code = value.as_str().unwrap_or_default().to_string(),
            _ => return Err(Error::Custom(format!("languages has no column {column}"))),
        }
        Ok(())
    }
}

impl Hooks for Language {}

/// Soft-deletable owner of every relationship kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub age: i32,
    pub company_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub pets: Vec<Pet>,
    pub company: Option<Company>,
    pub languages: Vec<Language>,
}

impl Model for User {
    const TABLE_NAME: &'static str = "users";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[
        RelationshipInfo::new("Pets", RelationshipKind::HasMany, RelatedModel::of::<Pet>())
            .local_key("id")
            .remote_key("user_id"),
        RelationshipInfo::new(
            "Company",
            RelationshipKind::BelongsTo,
            RelatedModel::of::<Company>(),
        )
        .local_key("company_id")
        .remote_key("id"),
        RelationshipInfo::new(
            "Languages",
            RelationshipKind::ManyToMany,
            RelatedModel::of::<Language>(),
        )
        .local_key("id")
        .remote_key("id")
        .link(LinkTableInfo::new("user_languages", "user_id", "language_id")),
    ];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("name", "name", SqlType::Text),
            FieldInfo::new("age", "age", SqlType::Integer),
            FieldInfo::new("company_id", "company_id", SqlType::BigInt).nullable(true),
            FieldInfo::new("created_at", "created_at", SqlType::BigInt)
                .create_only(true)
                .auto_create_time(TimeUnit::Millis),
            FieldInfo::new("updated_at", "updated_at", SqlType::BigInt)
                .auto_update_time(TimeUnit::Millis),
            FieldInfo::new("deleted_at", "deleted_at", SqlType::BigInt)
                .nullable(true)
                .soft_delete(TimeUnit::Millis),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("name", self.name.as_str().into()),
            ("age", self.age.into()),
            ("company_id", self.company_id.into()),
            ("created_at", self.created_at.into()),
            ("updated_at", self.updated_at.into()),
            ("deleted_at", self.deleted_at.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_or_default("id")?,
            name: row.get_or_default("name")?,
            age: row.get_or_default("age")?,
            company_id: row.get_or_default("company_id")?,
            created_at: row.get_or_default("created_at")?,
            updated_at: row.get_or_default("updated_at")?,
            deleted_at: row.get_or_default("deleted_at")?,
            ..Self::default()
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.as_i64().unwrap_or_default(),
            "name" => self.name = value.as_str().unwrap_or_default().to_string(),
            "age" => self.age = i32::try_from(value.as_i64().unwrap_or_default()).unwrap_or(0),
            "company_id" => self.company_id = value.as_i64().unwrap_or_default(),
            "created_at" => self.created_at = value.as_i64().unwrap_or_default(),
            "updated_at" => self.updated_at = value.as_i64().unwrap_or_default(),
            "deleted_at" => self.deleted_at = value.as_i64(),
            _ => return Err(Error::Custom(format!("users has no column {column}"))),
        }
        Ok(())
    }

    fn attach_related(
        &mut self,
        relation: &str,
        related: Vec<Box<dyn relmap_core::DynModel>>,
    ) -> Result<()> {
        match relation {
            "Pets" => self.pets = downcast_many(related)?,
            "Company" => self.company = downcast_one(related)?,
            "Languages" => self.languages = downcast_many(related)?,
            other => return Err(Error::Custom(format!("users has no relation {other}"))),
        }
        Ok(())
    }

    fn associations_mut(&mut self, relation: &str) -> Vec<&mut dyn relmap_core::DynModel> {
        match relation {
            "Pets" => self
                .pets
                .iter_mut()
                .map(|p| p as &mut dyn relmap_core::DynModel)
                .collect(),
            "Company" => self
                .company
                .iter_mut()
                .map(|c| c as &mut dyn relmap_core::DynModel)
                .collect(),
            "Languages" => self
                .languages
                .iter_mut()
                .map(|l| l as &mut dyn relmap_core::DynModel)
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Hooks for User {}
