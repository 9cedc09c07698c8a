//! JOIN clauses.
//!
//! A join request either names a relationship of the queried record type, in
//! which case the join is derived from its descriptor, or is a raw fragment
//! passed through with its parameters.

use relmap_core::{
    Dialect, Error, RelationshipInfo, RelationshipKind, Result, SchemaError, SchemaErrorKind,
    Value,
};

use crate::writer::SqlWriter;

/// Separator between a relationship alias and a column in joined projections.
pub const ALIAS_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq)]
pub enum JoinRequest {
    /// A relationship name, or raw join SQL when no relationship matches.
    Named { target: String, params: Vec<Value> },
    /// A relationship join with an extra ON condition.
    Relation {
        name: String,
        fragment: String,
        params: Vec<Value>,
    },
}

/// Joins resolved against the queried table.
#[derive(Debug, Default)]
pub(crate) struct RenderedJoins {
    pub sql: Vec<String>,
    pub relations: Vec<&'static RelationshipInfo>,
}

/// Resolve relationship names to descriptors; raw joins resolve to `None`.
pub(crate) fn resolve<'r>(
    requests: &'r [JoinRequest],
    relationships: &'static [RelationshipInfo],
    table: &str,
) -> Result<Vec<(&'r JoinRequest, Option<&'static RelationshipInfo>)>> {
    requests
        .iter()
        .map(|request| match request {
            JoinRequest::Named { target, params } => {
                let rel = if params.is_empty() {
                    relationships.iter().find(|r| r.name == target.as_str())
                } else {
                    None
                };
                Ok((request, rel))
            }
            JoinRequest::Relation { name, .. } => relationships
                .iter()
                .find(|r| r.name == name.as_str())
                .map(|rel| (request, Some(rel)))
                .ok_or_else(|| {
                    Error::Schema(SchemaError {
                        kind: SchemaErrorKind::UnknownRelationship,
                        model: "join",
                        message: format!("no relationship named '{name}' on table '{table}'"),
                    })
                }),
        })
        .collect()
}

/// Render resolved joins in order, binding their parameters.
pub(crate) fn render(
    w: &mut SqlWriter,
    resolved: &[(&JoinRequest, Option<&'static RelationshipInfo>)],
    owner_table: &str,
    unscoped: bool,
) -> Result<RenderedJoins> {
    let mut out = RenderedJoins::default();
    for &(request, rel) in resolved {
        match (request, rel) {
            (JoinRequest::Named { target, params }, None) => {
                out.sql.push(w.fragment(target, params)?);
            }
            (JoinRequest::Named { .. }, Some(rel)) => {
                out.sql
                    .push(relation_join(w, owner_table, rel, None, unscoped)?);
                out.relations.push(rel);
            }
            (JoinRequest::Relation { fragment, params, .. }, Some(rel)) => {
                out.sql.push(relation_join(
                    w,
                    owner_table,
                    rel,
                    Some((fragment.as_str(), params.as_slice())),
                    unscoped,
                )?);
                out.relations.push(rel);
            }
            (JoinRequest::Relation { name, .. }, None) => {
                return Err(Error::Custom(format!("unresolved relationship join '{name}'")));
            }
        }
    }
    Ok(out)
}

/// `LEFT JOIN` for one relationship, aliased by the relationship name.
///
/// Many-to-many relationships join through the join table, aliased
/// `<Relationship>__join`.
pub fn relation_join(
    w: &mut SqlWriter,
    owner_table: &str,
    rel: &RelationshipInfo,
    extra: Option<(&str, &[Value])>,
    unscoped: bool,
) -> Result<String> {
    let alias = rel.name;
    let mut sql = match (rel.kind, rel.link_table) {
        (RelationshipKind::ManyToMany, Some(link)) => {
            let link_alias = format!("{alias}{ALIAS_SEPARATOR}join");
            format!(
                "LEFT JOIN {} {} ON {} = {} LEFT JOIN {} {} ON {} = {}",
                w.ident(link.table_name),
                w.ident(&link_alias),
                w.qualified(&link_alias, link.local_column),
                w.qualified(owner_table, rel.local_key),
                w.ident(rel.related.table),
                w.ident(alias),
                w.qualified(alias, rel.remote_key),
                w.qualified(&link_alias, link.remote_column),
            )
        }
        _ => format!(
            "LEFT JOIN {} {} ON {} = {}",
            w.ident(rel.related.table),
            w.ident(alias),
            w.qualified(alias, rel.remote_key),
            w.qualified(owner_table, rel.local_key),
        ),
    };
    if let Some((fragment, params)) = extra {
        let rendered = w.fragment(fragment, params)?;
        sql.push_str(&format!(" AND ({rendered})"));
    }
    if !unscoped {
        if let Some(column) = rel.related.soft_delete_column() {
            sql.push_str(&format!(" AND {} IS NULL", w.qualified(alias, column)));
        }
    }
    Ok(sql)
}

/// Projection for a joined relationship: every persisted related column,
/// aliased `"<Relationship>__<column>"`.
pub fn relation_columns(dialect: Dialect, rel: &RelationshipInfo) -> Vec<String> {
    rel.related
        .fields()
        .iter()
        .filter(|f| f.is_insertable())
        .map(|f| {
            format!(
                "{} AS {}",
                dialect.qualified(rel.name, f.column_name),
                dialect.quote_identifier(&format!("{}{ALIAS_SEPARATOR}{}", rel.name, f.column_name))
            )
        })
        .collect()
}
