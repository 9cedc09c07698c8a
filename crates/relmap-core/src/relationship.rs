//! Relationship metadata.
//!
//! Relationships are declared as static metadata on each `Model`. The query
//! builder and the association resolver use it to render joins and to load,
//! group and attach related records without knowing their concrete type.

use std::fmt;

use crate::Result;
use crate::field::FieldInfo;
use crate::model::{DynModel, Model, decode_boxed};
use crate::row::Row;

/// The kind of relationship between an owner and its related records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// The owner carries a foreign key to the related record.
    BelongsTo,
    /// The related record carries a foreign key to the owner; at most one.
    HasOne,
    /// The related records carry a foreign key to the owner.
    HasMany,
    /// Owner and related records are linked through a join table.
    ManyToMany,
}

impl RelationshipKind {
    /// Does this relationship resolve to at most one record?
    pub const fn is_single(self) -> bool {
        matches!(self, RelationshipKind::BelongsTo | RelationshipKind::HasOne)
    }
}

/// Information about a join table for many-to-many relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The join table name (e.g., `"user_languages"`).
    pub table_name: &'static str,

    /// Column in the join table pointing at the owner (e.g., `"user_id"`).
    pub local_column: &'static str,

    /// Column in the join table pointing at the related record (e.g., `"language_id"`).
    pub remote_column: &'static str,
}

impl LinkTableInfo {
    #[must_use]
    pub const fn new(
        table_name: &'static str,
        local_column: &'static str,
        remote_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            local_column,
            remote_column,
        }
    }
}

/// Handle to the related record type, usable without naming it.
#[derive(Clone, Copy)]
pub struct RelatedModel {
    pub table: &'static str,
    pub primary_key: &'static [&'static str],
    type_name: fn() -> &'static str,
    fields: fn() -> &'static [FieldInfo],
    relationships: fn() -> &'static [RelationshipInfo],
    decode: fn(&Row) -> Result<Box<dyn DynModel>>,
}

fn relationships_of<T: Model>() -> &'static [RelationshipInfo] {
    T::RELATIONSHIPS
}

impl RelatedModel {
    pub const fn of<T: Model>() -> Self {
        Self {
            table: T::TABLE_NAME,
            primary_key: T::PRIMARY_KEY,
            type_name: std::any::type_name::<T>,
            fields: T::fields,
            relationships: relationships_of::<T>,
            decode: decode_boxed::<T>,
        }
    }

    pub fn type_name(&self) -> &'static str {
        (self.type_name)()
    }

    pub fn fields(&self) -> &'static [FieldInfo] {
        (self.fields)()
    }

    pub fn relationships(&self) -> &'static [RelationshipInfo] {
        (self.relationships)()
    }

    /// Decode one row into a boxed related record.
    pub fn decode(&self, row: &Row) -> Result<Box<dyn DynModel>> {
        (self.decode)(row)
    }

    /// Soft-delete column of the related table, if it has one.
    pub fn soft_delete_column(&self) -> Option<&'static str> {
        self.fields()
            .iter()
            .find(|f| f.soft_delete.is_some())
            .map(|f| f.column_name)
    }

    /// Find a relationship declared on the related type.
    pub fn relationship(&self, name: &str) -> Option<&'static RelationshipInfo> {
        self.relationships().iter().find(|r| r.name == name)
    }
}

impl fmt::Debug for RelatedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelatedModel")
            .field("type", &self.type_name())
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .finish()
    }
}

/// Static description of one relationship on a record type.
///
/// `local_key` is always the owner-side join column and `remote_key` the
/// related-side one:
///
/// | kind | `local_key` | `remote_key` |
/// |---|---|---|
/// | `BelongsTo` | foreign key on the owner | related primary key |
/// | `HasOne` / `HasMany` | owner primary key | foreign key on the related table |
/// | `ManyToMany` | owner primary key | related primary key |
///
/// Many-to-many relationships additionally name their join table.
#[derive(Debug, Clone, Copy)]
pub struct RelationshipInfo {
    /// Relationship name, also used as the join alias (e.g., `"Wallet"`).
    pub name: &'static str,
    pub kind: RelationshipKind,
    pub related: RelatedModel,
    pub local_key: &'static str,
    pub remote_key: &'static str,
    pub link_table: Option<LinkTableInfo>,
}

impl RelationshipInfo {
    /// Create a relationship with keys left empty.
    ///
    /// The keys must be set before the owning type is described; the registry
    /// rejects relationships with missing keys.
    #[must_use]
    pub const fn new(name: &'static str, kind: RelationshipKind, related: RelatedModel) -> Self {
        Self {
            name,
            kind,
            related,
            local_key: "",
            remote_key: "",
            link_table: None,
        }
    }

    #[must_use]
    pub const fn local_key(mut self, column: &'static str) -> Self {
        self.local_key = column;
        self
    }

    #[must_use]
    pub const fn remote_key(mut self, column: &'static str) -> Self {
        self.remote_key = column;
        self
    }

    #[must_use]
    pub const fn link(mut self, link: LinkTableInfo) -> Self {
        self.link_table = Some(link);
        self
    }

    pub const fn is_single(&self) -> bool {
        self.kind.is_single()
    }

    /// Column on the related rows whose value identifies the owning record
    /// when grouping loaded rows (the join-table column for many-to-many).
    pub fn grouping_column(&self) -> &'static str {
        match (self.kind, self.link_table) {
            (RelationshipKind::ManyToMany, Some(link)) => link.local_column,
            _ => self.remote_key,
        }
    }
}
