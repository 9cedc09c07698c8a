//! SELECT specification and rendering.
//!
//! [`SelectSpec`] is untyped: it renders against a [`Target`] describing the
//! table. `Query<M>` wraps it for record types, and the association resolver
//! uses it directly for related tables it only knows through descriptors.

use relmap_core::{
    Dialect, FieldInfo, RecordDescriptor, RelatedModel, RelationshipInfo, Result, Value,
};

use crate::clause::{LockMode, OrderBy, quote_column};
use crate::condition::{Condition, Connector, Term, render_terms};
use crate::join::{self, JoinRequest};
use crate::writer::{SqlWriter, Statement};

/// The table a specification renders against.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub table: &'a str,
    pub primary_key: &'static [&'static str],
    pub fields: &'static [FieldInfo],
    pub relationships: &'static [RelationshipInfo],
    pub soft_delete: Option<&'static str>,
}

impl Target<'static> {
    pub fn from_descriptor(descriptor: &'static RecordDescriptor) -> Self {
        Self {
            table: descriptor.table,
            primary_key: descriptor.primary_key,
            fields: descriptor.fields,
            relationships: descriptor.relationships,
            soft_delete: descriptor.soft_delete_column(),
        }
    }

    pub fn related(related: &RelatedModel) -> Self {
        Self {
            table: related.table,
            primary_key: related.primary_key,
            fields: related.fields(),
            relationships: related.relationships(),
            soft_delete: related.soft_delete_column(),
        }
    }
}

impl<'a> Target<'a> {
    /// Render against another table name with the same columns.
    pub fn with_table<'b>(self, table: &'b str) -> Target<'b> {
        Target {
            table,
            primary_key: self.primary_key,
            fields: self.fields,
            relationships: self.relationships,
            soft_delete: self.soft_delete,
        }
    }
}

/// A rendered SELECT plus the relationships joined into its projection.
#[derive(Debug, Clone)]
pub struct BuiltSelect {
    pub statement: Statement,
    pub joined: Vec<&'static RelationshipInfo>,
}

/// Everything a SELECT can carry apart from the record type.
#[derive(Debug, Clone, Default)]
pub struct SelectSpec {
    terms: Vec<Term>,
    columns: Vec<String>,
    extra_columns: Vec<String>,
    joins: Vec<JoinRequest>,
    order: Vec<OrderBy>,
    group: Vec<String>,
    having: Vec<(String, Vec<Value>)>,
    limit: Option<u64>,
    offset: Option<u64>,
    distinct: bool,
    lock: Option<LockMode>,
    unscoped: bool,
}

impl SelectSpec {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, connector: Connector, condition: Condition) -> Self {
        self.terms.push(Term {
            connector,
            condition,
        });
        self
    }

    pub fn filter(self, fragment: impl Into<String>, params: Vec<Value>) -> Self {
        self.push(Connector::And, Condition::raw(fragment, params))
    }

    pub fn or_filter(self, fragment: impl Into<String>, params: Vec<Value>) -> Self {
        self.push(Connector::Or, Condition::raw(fragment, params))
    }

    pub fn not_filter(self, fragment: impl Into<String>, params: Vec<Value>) -> Self {
        self.push(Connector::Not, Condition::raw(fragment, params))
    }

    pub fn filter_by(self, condition: Condition) -> Self {
        self.push(Connector::And, condition)
    }

    pub fn or_by(self, condition: Condition) -> Self {
        self.push(Connector::Or, condition)
    }

    pub fn not_by(self, condition: Condition) -> Self {
        self.push(Connector::Not, condition)
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Append a raw projection item after the regular columns.
    pub fn select_extra(mut self, expr: impl Into<String>) -> Self {
        self.extra_columns.push(expr.into());
        self
    }

    pub fn join(mut self, request: JoinRequest) -> Self {
        self.joins.push(request);
        self
    }

    pub fn order(mut self, order: impl Into<OrderBy>) -> Self {
        self.order.push(order.into());
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn group(mut self, expr: impl Into<String>) -> Self {
        self.group.push(expr.into());
        self
    }

    pub fn having(mut self, fragment: impl Into<String>, params: Vec<Value>) -> Self {
        self.having.push((fragment.into(), params));
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn lock(mut self, mode: LockMode) -> Self {
        self.lock = Some(mode);
        self
    }

    pub fn unscoped(mut self) -> Self {
        self.unscoped = true;
        self
    }

    /// Does any term render SQL? The soft-delete filter does not count.
    pub fn has_conditions(&self) -> bool {
        self.terms.iter().any(|t| !t.condition.is_empty())
    }

    pub fn lock_mode(&self) -> Option<LockMode> {
        self.lock
    }

    pub fn is_unscoped(&self) -> bool {
        self.unscoped
    }

    pub fn join_requests(&self) -> &[JoinRequest] {
        &self.joins
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Render the WHERE expression (without the keyword).
    ///
    /// The soft-delete filter is appended unless the spec is unscoped or
    /// `with_soft_delete` is false; a user expression is parenthesized before
    /// it is combined with the filter.
    pub fn render_where(
        &self,
        w: &mut SqlWriter,
        target: &Target<'_>,
        with_soft_delete: bool,
    ) -> Result<Option<String>> {
        let user = render_terms(w, &self.terms, target.table)?;
        let soft = match target.soft_delete {
            Some(column) if with_soft_delete && !self.unscoped => {
                Some(format!("{} IS NULL", w.qualified(target.table, column)))
            }
            _ => None,
        };
        Ok(match (user, soft) {
            (Some(user), Some(soft)) => Some(format!("({user}) AND {soft}")),
            (Some(user), None) => Some(user),
            (None, soft) => soft,
        })
    }

    /// Render a full SELECT.
    pub fn build_select(&self, dialect: Dialect, target: &Target<'_>) -> Result<BuiltSelect> {
        let mut w = SqlWriter::new(dialect);
        let (sql, joined) = self.render_select(&mut w, target, true)?;
        tracing::trace!(
            table = target.table,
            sql = %sql,
            params = w.param_count(),
            joined = joined.len(),
            "built select"
        );
        Ok(BuiltSelect {
            statement: w.finish(sql),
            joined,
        })
    }

    /// Render `SELECT COUNT(*)` over the rows this spec matches.
    ///
    /// Grouped or distinct specs are counted through a subquery. Ordering,
    /// limit and offset are ignored.
    pub fn build_count(&self, dialect: Dialect, target: &Target<'_>) -> Result<Statement> {
        let mut w = SqlWriter::new(dialect);
        if self.group.is_empty() && !self.distinct {
            let resolved = join::resolve(&self.joins, target.relationships, target.table)?;
            let joins = join::render(&mut w, &resolved, target.table, self.unscoped)?;
            let mut sql = format!("SELECT COUNT(*) FROM {}", w.ident(target.table));
            for join in &joins.sql {
                sql.push(' ');
                sql.push_str(join);
            }
            if let Some(cond) = self.render_where(&mut w, target, true)? {
                sql.push_str(" WHERE ");
                sql.push_str(&cond);
            }
            return Ok(w.finish(sql));
        }
        let (inner, _) = self.render_select(&mut w, target, false)?;
        let sql = format!(
            "SELECT COUNT(*) FROM ({inner}) AS {}",
            w.ident("counted")
        );
        Ok(w.finish(sql))
    }

    fn render_select(
        &self,
        w: &mut SqlWriter,
        target: &Target<'_>,
        paginate: bool,
    ) -> Result<(String, Vec<&'static RelationshipInfo>)> {
        let dialect = w.dialect();
        let resolved = join::resolve(&self.joins, target.relationships, target.table)?;
        let relations: Vec<&'static RelationshipInfo> =
            resolved.iter().filter_map(|(_, rel)| *rel).collect();

        let mut projection: Vec<String> = if !self.columns.is_empty() {
            self.columns
                .iter()
                .map(|c| quote_column(dialect, c))
                .collect()
        } else if !relations.is_empty() {
            target
                .fields
                .iter()
                .filter(|f| f.is_insertable())
                .map(|f| dialect.qualified(target.table, f.column_name))
                .collect()
        } else if !self.extra_columns.is_empty() {
            vec![format!("{}.*", dialect.quote_identifier(target.table))]
        } else {
            vec!["*".to_string()]
        };
        for rel in &relations {
            projection.extend(join::relation_columns(dialect, rel));
        }
        projection.extend(self.extra_columns.iter().cloned());

        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&projection.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(&w.ident(target.table));

        let joins = join::render(w, &resolved, target.table, self.unscoped)?;
        for join in &joins.sql {
            sql.push(' ');
            sql.push_str(join);
        }

        if let Some(cond) = self.render_where(w, target, true)? {
            sql.push_str(" WHERE ");
            sql.push_str(&cond);
        }

        if !self.group.is_empty() {
            let group: Vec<String> = self.group.iter().map(|g| quote_column(dialect, g)).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&group.join(", "));
        }

        if !self.having.is_empty() {
            let mut parts = Vec::with_capacity(self.having.len());
            for (fragment, params) in &self.having {
                parts.push(w.fragment(fragment, params)?);
            }
            sql.push_str(" HAVING ");
            if parts.len() == 1 {
                sql.push_str(&parts[0]);
            } else {
                let wrapped: Vec<String> = parts.iter().map(|p| format!("({p})")).collect();
                sql.push_str(&wrapped.join(" AND "));
            }
        }

        if paginate {
            if !self.order.is_empty() {
                let order: Vec<String> = self.order.iter().map(|o| o.to_sql(dialect)).collect();
                sql.push_str(" ORDER BY ");
                sql.push_str(&order.join(", "));
            }
            sql.push_str(&pagination(dialect, self.limit, self.offset));
            if let Some(lock) = self.lock.and_then(|l| l.to_sql(dialect)) {
                sql.push(' ');
                sql.push_str(lock);
            }
        }

        Ok((sql, joins.relations))
    }
}

/// LIMIT/OFFSET rendered as literals.
fn pagination(dialect: Dialect, limit: Option<u64>, offset: Option<u64>) -> String {
    match (limit, offset) {
        (Some(limit), Some(offset)) => format!(" LIMIT {limit} OFFSET {offset}"),
        (Some(limit), None) => format!(" LIMIT {limit}"),
        (None, Some(offset)) => match dialect {
            Dialect::Postgres => format!(" OFFSET {offset}"),
            Dialect::Sqlite => format!(" LIMIT -1 OFFSET {offset}"),
            Dialect::Mysql => format!(" LIMIT 18446744073709551615 OFFSET {offset}"),
        },
        (None, None) => String::new(),
    }
}
