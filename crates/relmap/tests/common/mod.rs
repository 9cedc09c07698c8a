//! Scriptable connection and records shared by the integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use asupersync::runtime::RuntimeBuilder;
use relmap::prelude::*;
use relmap::{Dialect, DynModel, downcast_many};

type QueryFn = dyn Fn(&str, &[Value]) -> Result<Vec<Row>> + Send + Sync;
type ExecuteFn = dyn Fn(&str, &[Value]) -> Result<u64> + Send + Sync;

#[derive(Default)]
struct Script {
    log: Vec<(String, Vec<Value>)>,
    on_query: Option<Arc<QueryFn>>,
    on_execute: Option<Arc<ExecuteFn>>,
    next_id: i64,
}

/// Logs every statement and answers through caller-supplied handlers.
///
/// Without a handler, queries return no rows and writes affect one row.
#[derive(Clone)]
pub struct Recorder {
    script: Arc<Mutex<Script>>,
    dialect: Dialect,
}

impl Recorder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            dialect,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().expect("lock poisoned")
    }

    pub fn on_query<F>(&self, handler: F)
    where
        F: Fn(&str, &[Value]) -> Result<Vec<Row>> + Send + Sync + 'static,
    {
        self.lock().on_query = Some(Arc::new(handler));
    }

    pub fn on_execute<F>(&self, handler: F)
    where
        F: Fn(&str, &[Value]) -> Result<u64> + Send + Sync + 'static,
    {
        self.lock().on_execute = Some(Arc::new(handler));
    }

    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().log.clone()
    }

    pub fn sql(&self) -> Vec<String> {
        self.lock().log.iter().map(|(sql, _)| sql.clone()).collect()
    }

    fn record(&self, sql: &str, params: &[Value]) {
        self.lock().log.push((sql.to_string(), params.to_vec()));
    }
}

impl Connection for Recorder {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        self.record(sql, params);
        let handler = self.lock().on_query.clone();
        let outcome = match handler.map_or(Ok(Vec::new()), |h| h(sql, params)) {
            Ok(rows) => Outcome::Ok(rows),
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
        self.record(sql, params);
        let handler = self.lock().on_execute.clone();
        let outcome = match handler.map_or(Ok(1), |h| h(sql, params)) {
            Ok(n) => Outcome::Ok(n),
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
        self.record(sql, params);
        let mut script = self.lock();
        script.next_id += 1;
        let id = script.next_id;
        async move { Outcome::Ok(id) }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }
}

pub fn run<F, Fut>(f: F)
where
    F: FnOnce(Cx) -> Fut,
    Fut: Future<Output = ()>,
{
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(f(Cx::for_testing()));
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn unwrap_err<T>(outcome: Outcome<T, Error>) -> Error {
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
// Records
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Book {
    pub id: i64,
    pub author_id: i64,
    pub title: String,
}

impl Model for Book {
    const TABLE_NAME: &'static str = "books";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("author_id", "author_id", SqlType::BigInt),
            FieldInfo::new("title", "title", SqlType::Text),
        ];
        FIELDS
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("id", self.id.into()),
            ("author_id", self.author_id.into()),
            ("title", self.title.as_str().into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_or_default("id")?,
            author_id: row.get_or_default("author_id")?,
            title: row.get_or_default("title")?,
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.as_i64().unwrap_or_default(),
            "author_id" => self.author_id = value.as_i64().unwrap_or_default(),
            "title" => self.title = value.as_str().unwrap_or_default().to_string(),
            _ => return Err(Error::Custom(format!("books has no column {column}"))),
        }
        Ok(())
    }
}

impl Hooks for Book {}

/// Soft-deletable, timestamped, with a unique `name`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Author {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
    pub books: Vec<Book>,
}

impl Author {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Model for Author {
    const TABLE_NAME: &'static str = "authors";
    const PRIMARY_KEY: &'static [&'static str] = &["id"];
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[RelationshipInfo::new(
        "Books",
        RelationshipKind::HasMany,
        RelatedModel::of::<Book>(),
    )
    .local_key("id")
    .remote_key("author_id")];

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt)
                .primary_key(true)
                .auto_increment(true),
            FieldInfo::new("name", "name", SqlType::Text),
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
            ("created_at", self.created_at.into()),
            ("updated_at", self.updated_at.into()),
            ("deleted_at", self.deleted_at.into()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_or_default("id")?,
            name: row.get_or_default("name")?,
            created_at: row.get_or_default("created_at")?,
            updated_at: row.get_or_default("updated_at")?,
            deleted_at: row.get_or_default("deleted_at")?,
            books: Vec::new(),
        })
    }

    fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
        match column {
            "id" => self.id = value.as_i64().unwrap_or_default(),
            "name" => self.name = value.as_str().unwrap_or_default().to_string(),
            "created_at" => self.created_at = value.as_i64().unwrap_or_default(),
            "updated_at" => self.updated_at = value.as_i64().unwrap_or_default(),
            "deleted_at" => self.deleted_at = value.as_i64(),
            _ => return Err(Error::Custom(format!("authors has no column {column}"))),
        }
        Ok(())
    }

    fn attach_related(&mut self, relation: &str, related: Vec<Box<dyn DynModel>>) -> Result<()> {
        match relation {
            "Books" => self.books = downcast_many(related)?,
            other => return Err(Error::Custom(format!("authors has no relation {other}"))),
        }
        Ok(())
    }

    fn associations_mut(&mut self, relation: &str) -> Vec<&mut dyn DynModel> {
        match relation {
            "Books" => self
                .books
                .iter_mut()
                .map(|b| b as &mut dyn DynModel)
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl Hooks for Author {}

/// Bound values per `authors` INSERT row when the key is left to the store.
pub const AUTHOR_INSERT_WIDTH: usize = 4;
