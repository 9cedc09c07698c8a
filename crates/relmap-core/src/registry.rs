//! Record descriptors and the process-wide schema registry.
//!
//! [`describe`] turns a `Model` impl into a validated, immutable
//! [`RecordDescriptor`]. Descriptors are built on first use and cached for the
//! lifetime of the process; they are never invalidated.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, OnceLock, RwLock};

use crate::Result;
use crate::dialect::is_plain_identifier;
use crate::error::{Error, SchemaErrorKind};
use crate::field::{FieldInfo, TimeUnit};
use crate::model::Model;
use crate::relationship::{RelationshipInfo, RelationshipKind};

/// Validated metadata for one record type.
#[derive(Debug)]
pub struct RecordDescriptor {
    pub type_name: &'static str,
    pub table: &'static str,
    pub fields: &'static [FieldInfo],
    pub primary_key: &'static [&'static str],
    pub relationships: &'static [RelationshipInfo],
    /// Soft-delete column and how it stores the deletion time
    pub soft_delete: Option<(&'static str, TimeUnit)>,
}

impl RecordDescriptor {
    pub fn field(&self, column: &str) -> Option<&'static FieldInfo> {
        self.fields.iter().find(|f| f.column_name == column)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.field(column).is_some()
    }

    pub fn relationship(&self, name: &str) -> Option<&'static RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn soft_delete_column(&self) -> Option<&'static str> {
        self.soft_delete.map(|(column, _)| column)
    }

    /// The store-assigned primary key column, if the key is a single
    /// auto-increment column.
    pub fn auto_increment_column(&self) -> Option<&'static str> {
        match self.primary_key {
            [pk] => self
                .field(pk)
                .filter(|f| f.auto_increment)
                .map(|f| f.column_name),
            _ => None,
        }
    }

    /// Persisted columns, in declaration order.
    pub fn columns(&self) -> impl Iterator<Item = &'static FieldInfo> {
        self.fields.iter().filter(|f| f.is_insertable())
    }
}

type Cache = RwLock<HashMap<TypeId, &'static RecordDescriptor>>;

fn cache() -> &'static Cache {
    static CACHE: OnceLock<Cache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// One end of a join table: the table it references and the join-table
/// column holding that table's key.
pub type JoinEndpoint = (&'static str, &'static str);

/// A registered many-to-many join table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTableEntry {
    pub table: &'static str,
    /// Endpoints in sorted order, so both sides of a relationship compare equal.
    pub endpoints: [JoinEndpoint; 2],
}

fn join_tables() -> &'static Mutex<BTreeMap<&'static str, [JoinEndpoint; 2]>> {
    static JOIN_TABLES: OnceLock<Mutex<BTreeMap<&'static str, [JoinEndpoint; 2]>>> =
        OnceLock::new();
    JOIN_TABLES.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Describe a record type, validating it on first use.
pub fn describe<M: Model>() -> Result<&'static RecordDescriptor> {
    let key = TypeId::of::<M>();
    {
        let cache = cache().read().unwrap_or_else(|e| e.into_inner());
        if let Some(descriptor) = cache.get(&key) {
            return Ok(descriptor);
        }
    }

    let mut cache = cache().write().unwrap_or_else(|e| e.into_inner());
    if let Some(descriptor) = cache.get(&key) {
        return Ok(descriptor);
    }

    let descriptor = build::<M>()?;
    let descriptor: &'static RecordDescriptor = Box::leak(Box::new(descriptor));
    cache.insert(key, descriptor);
    tracing::debug!(
        model = descriptor.type_name,
        table = descriptor.table,
        relationships = descriptor.relationships.len(),
        "registered record descriptor"
    );
    Ok(descriptor)
}

/// Look up a relationship declared on `M` by name.
pub fn find_relationship<M: Model>(name: &str) -> Result<&'static RelationshipInfo> {
    let descriptor = describe::<M>()?;
    descriptor.relationship(name).ok_or_else(|| {
        Error::schema(
            SchemaErrorKind::UnknownRelationship,
            descriptor.type_name,
            format!("no relationship named '{name}' on table '{}'", descriptor.table),
        )
    })
}

/// Join tables registered so far, sorted by name.
pub fn registered_join_tables() -> Vec<JoinTableEntry> {
    let tables = join_tables().lock().unwrap_or_else(|e| e.into_inner());
    tables
        .iter()
        .map(|(table, endpoints)| JoinTableEntry {
            table: *table,
            endpoints: *endpoints,
        })
        .collect()
}

fn build<M: Model>() -> Result<RecordDescriptor> {
    let model = std::any::type_name::<M>();
    let fields = M::fields();

    check_identifier(model, "table", M::TABLE_NAME)?;
    for field in fields {
        check_identifier(model, "column", field.column_name)?;
    }

    if M::PRIMARY_KEY.is_empty() {
        return Err(Error::schema(
            SchemaErrorKind::MissingPrimaryKey,
            model,
            format!("table '{}' declares no primary key", M::TABLE_NAME),
        ));
    }
    for pk in M::PRIMARY_KEY {
        if !fields.iter().any(|f| f.column_name == *pk) {
            return Err(Error::schema(
                SchemaErrorKind::MissingPrimaryKey,
                model,
                format!("primary key column '{pk}' is not a field of '{}'", M::TABLE_NAME),
            ));
        }
    }

    let mut links = Vec::new();
    for rel in M::RELATIONSHIPS {
        check_identifier(model, "relationship", rel.name)?;
        check_relationship(model, M::TABLE_NAME, fields, rel)?;
        if let Some(link) = rel.link_table {
            let mut endpoints = [
                (M::TABLE_NAME, link.local_column),
                (rel.related.table, link.remote_column),
            ];
            endpoints.sort_unstable();
            links.push((link.table_name, endpoints));
        }
    }
    register_join_tables(model, &links)?;

    let soft_delete = fields
        .iter()
        .find_map(|f| f.soft_delete.map(|unit| (f.column_name, unit)));

    Ok(RecordDescriptor {
        type_name: model,
        table: M::TABLE_NAME,
        fields,
        primary_key: M::PRIMARY_KEY,
        relationships: M::RELATIONSHIPS,
        soft_delete,
    })
}

fn check_identifier(model: &'static str, what: &str, name: &str) -> Result<()> {
    if is_plain_identifier(name) {
        Ok(())
    } else {
        Err(Error::schema(
            SchemaErrorKind::InvalidIdentifier,
            model,
            format!("{what} name '{name}' is not a plain SQL identifier"),
        ))
    }
}

fn check_relationship(
    model: &'static str,
    table: &'static str,
    fields: &[FieldInfo],
    rel: &RelationshipInfo,
) -> Result<()> {
    let unknown = |message: String| Error::schema(SchemaErrorKind::UnknownForeignKey, model, message);

    if rel.local_key.is_empty() || rel.remote_key.is_empty() {
        return Err(unknown(format!(
            "relationship '{}' is missing its join keys",
            rel.name
        )));
    }
    if !fields.iter().any(|f| f.column_name == rel.local_key) {
        return Err(unknown(format!(
            "relationship '{}' names column '{}' which '{table}' does not have",
            rel.name, rel.local_key
        )));
    }
    if !rel
        .related
        .fields()
        .iter()
        .any(|f| f.column_name == rel.remote_key)
    {
        return Err(unknown(format!(
            "relationship '{}' names column '{}' which '{}' does not have",
            rel.name, rel.remote_key, rel.related.table
        )));
    }

    match (rel.kind, rel.link_table) {
        (RelationshipKind::ManyToMany, None) => Err(unknown(format!(
            "many-to-many relationship '{}' has no join table",
            rel.name
        ))),
        (RelationshipKind::ManyToMany, Some(link)) => {
            check_identifier(model, "join table", link.table_name)?;
            check_identifier(model, "join column", link.local_column)?;
            check_identifier(model, "join column", link.remote_column)
        }
        (_, Some(_)) => Err(unknown(format!(
            "only many-to-many relationships use a join table ('{}')",
            rel.name
        ))),
        (_, None) => Ok(()),
    }
}

fn register_join_tables(
    model: &'static str,
    links: &[(&'static str, [JoinEndpoint; 2])],
) -> Result<()> {
    let mut tables = join_tables().lock().unwrap_or_else(|e| e.into_inner());
    for (name, endpoints) in links {
        if let Some(existing) = tables.get(name) {
            if existing != endpoints {
                return Err(Error::schema(
                    SchemaErrorKind::JoinTableConflict,
                    model,
                    format!(
                        "join table '{name}' already links {existing:?}, not {endpoints:?}"
                    ),
                ));
            }
        }
    }
    for (name, endpoints) in links {
        tables.insert(*name, *endpoints);
    }
    Ok(())
}
