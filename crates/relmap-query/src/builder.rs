//! Statement builders for INSERT, UPDATE and DELETE.

use std::collections::BTreeMap;

use relmap_core::{Dialect, Error, Model, QueryErrorKind, Result, Value};

use crate::condition::json_to_value;
use crate::select::{SelectSpec, Target};
use crate::writer::{SqlWriter, Statement};

/// Conflict handling for INSERT statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnConflict {
    /// Skip rows that conflict.
    DoNothing,
    /// Overwrite every inserted column except the conflict target.
    UpdateAll,
    /// Overwrite only the listed columns.
    Update(Vec<String>),
}

/// INSERT statement builder, single or multi-row.
#[derive(Debug, Clone, Default)]
pub struct InsertBuilder {
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    on_conflict: Option<OnConflict>,
    conflict_target: Vec<String>,
    returning: Vec<String>,
}

impl InsertBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Add one row of values, in column order.
    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn on_conflict(mut self, action: OnConflict) -> Self {
        self.on_conflict = Some(action);
        self
    }

    /// Columns identifying a conflict (usually the primary key).
    pub fn conflict_target<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflict_target = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Ask for a generated column back; ignored by dialects without `RETURNING`.
    pub fn returning(mut self, column: impl Into<String>) -> Self {
        self.returning.push(column.into());
        self
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Build the INSERT SQL and parameters.
    pub fn build(&self, dialect: Dialect) -> Result<Statement> {
        if self.rows.is_empty() {
            return Err(Error::query(
                QueryErrorKind::Syntax,
                format!("INSERT into '{}' without any rows", self.table),
            ));
        }
        let mut w = SqlWriter::new(dialect);
        let ignore = dialect == Dialect::Mysql && self.on_conflict == Some(OnConflict::DoNothing);
        let mut sql = format!(
            "INSERT {}INTO {}",
            if ignore { "IGNORE " } else { "" },
            w.ident(&self.table)
        );

        if self.columns.is_empty() {
            if self.rows.len() > 1 || self.rows.iter().any(|r| !r.is_empty()) {
                return Err(Error::query(
                    QueryErrorKind::ParameterMismatch,
                    "multi-row INSERT needs explicit columns",
                ));
            }
            sql.push_str(match dialect {
                Dialect::Mysql => " () VALUES ()",
                Dialect::Postgres | Dialect::Sqlite => " DEFAULT VALUES",
            });
        } else {
            let columns: Vec<String> = self.columns.iter().map(|c| w.ident(c)).collect();
            sql.push_str(&format!(" ({}) VALUES ", columns.join(", ")));
            let mut tuples = Vec::with_capacity(self.rows.len());
            for (i, row) in self.rows.iter().enumerate() {
                if row.len() != self.columns.len() {
                    return Err(Error::query(
                        QueryErrorKind::ParameterMismatch,
                        format!(
                            "row {i} has {} value(s) for {} column(s)",
                            row.len(),
                            self.columns.len()
                        ),
                    ));
                }
                let values: Vec<String> = row
                    .iter()
                    .map(|v| match v {
                        Value::Default => "DEFAULT".to_string(),
                        other => w.bind(other.clone()),
                    })
                    .collect();
                tuples.push(format!("({})", values.join(", ")));
            }
            sql.push_str(&tuples.join(", "));
        }

        if let Some(action) = &self.on_conflict {
            sql.push_str(&self.conflict_clause(&w, action));
        }

        if !self.returning.is_empty() && dialect.supports_returning() {
            let cols: Vec<String> = self.returning.iter().map(|c| w.ident(c)).collect();
            sql.push_str(" RETURNING ");
            sql.push_str(&cols.join(", "));
        }
        Ok(w.finish(sql))
    }

    fn conflict_clause(&self, w: &SqlWriter, action: &OnConflict) -> String {
        let dialect = w.dialect();
        let update: Vec<&String> = match action {
            OnConflict::DoNothing => Vec::new(),
            OnConflict::UpdateAll => self
                .columns
                .iter()
                .filter(|c| !self.conflict_target.contains(*c))
                .collect(),
            OnConflict::Update(columns) => columns.iter().collect(),
        };

        if dialect == Dialect::Mysql {
            if update.is_empty() {
                return String::new();
            }
            let sets: Vec<String> = update
                .iter()
                .map(|c| format!("{0} = VALUES({0})", w.ident(c)))
                .collect();
            return format!(" ON DUPLICATE KEY UPDATE {}", sets.join(", "));
        }

        let target = if self.conflict_target.is_empty() {
            String::new()
        } else {
            let cols: Vec<String> = self.conflict_target.iter().map(|c| w.ident(c)).collect();
            format!(" ({})", cols.join(", "))
        };
        if update.is_empty() || self.conflict_target.is_empty() {
            return format!(" ON CONFLICT{target} DO NOTHING");
        }
        let sets: Vec<String> = update
            .iter()
            .map(|c| format!("{0} = excluded.{0}", w.ident(c)))
            .collect();
        format!(" ON CONFLICT{target} DO UPDATE SET {}", sets.join(", "))
    }
}

/// Right-hand side of a SET item.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignValue {
    Value(Value),
    /// SQL expression with `?` placeholders (e.g. `age + ?`).
    Expr { sql: String, params: Vec<Value> },
}

/// The SET list of an UPDATE.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignments {
    entries: Vec<(String, AssignValue)>,
}

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a value, replacing any earlier assignment of the same column.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column.into(), AssignValue::Value(value.into()));
        self
    }

    pub fn set_expr(
        mut self,
        column: impl Into<String>,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        self.insert(
            column.into(),
            AssignValue::Expr {
                sql: sql.into(),
                params,
            },
        );
        self
    }

    fn insert(&mut self, column: String, value: AssignValue) {
        match self.entries.iter_mut().find(|(c, _)| *c == column) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((column, value)),
        }
    }

    /// Every key of the map is assigned, zero values included; keys sorted.
    pub fn from_map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let sorted: BTreeMap<String, Value> = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: sorted
                .into_iter()
                .map(|(k, v)| (k, AssignValue::Value(v)))
                .collect(),
        }
    }

    /// Assign the record's non-zero updatable fields.
    ///
    /// Zero-valued fields are skipped, so a record cannot reset a column to
    /// `0`, `""` or `false`; use [`Assignments::from_map`] for that.
    pub fn from_record<M: Model>(record: &M) -> Self {
        let fields = M::fields();
        Self {
            entries: record
                .to_row()
                .into_iter()
                .filter(|(column, value)| {
                    !value.is_zero()
                        && fields
                            .iter()
                            .find(|f| f.column_name == *column)
                            .is_some_and(|f| f.is_updatable())
                })
                .map(|(column, value)| (column.to_string(), AssignValue::Value(value)))
                .collect(),
        }
    }

    pub fn from_json(object: serde_json::Value) -> Result<Self> {
        match object {
            serde_json::Value::Object(map) => Ok(Self::from_map(
                map.into_iter().map(|(k, v)| (k, json_to_value(v))),
            )),
            other => Err(Error::Custom(format!(
                "assignments must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.entries.iter().any(|(c, _)| c == column)
    }

    /// Drop assignments the caller asked to leave alone.
    pub fn without(mut self, columns: &[&str]) -> Self {
        self.entries.retain(|(c, _)| !columns.contains(&c.as_str()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AssignValue)> {
        self.entries.iter().map(|(c, v)| (c.as_str(), v))
    }

    fn render(&self, w: &mut SqlWriter) -> Result<String> {
        let mut parts = Vec::with_capacity(self.entries.len());
        for (column, value) in &self.entries {
            let rhs = match value {
                AssignValue::Value(Value::Default) => "DEFAULT".to_string(),
                AssignValue::Value(v) => w.bind(v.clone()),
                AssignValue::Expr { sql, params } => w.fragment(sql, params)?,
            };
            parts.push(format!("{} = {rhs}", w.ident(column)));
        }
        Ok(parts.join(", "))
    }
}

fn missing_where(verb: &str, table: &str) -> Error {
    Error::query(
        QueryErrorKind::MissingWhereClause,
        format!("{verb} on '{table}' without a WHERE condition"),
    )
}

/// `UPDATE ... SET ... WHERE ...`; refuses to run without user conditions.
pub fn build_update(
    spec: &SelectSpec,
    target: &Target<'_>,
    dialect: Dialect,
    assignments: &Assignments,
) -> Result<Statement> {
    if !spec.has_conditions() {
        return Err(missing_where("UPDATE", target.table));
    }
    if assignments.is_empty() {
        return Err(Error::query(
            QueryErrorKind::Syntax,
            format!("UPDATE on '{}' without any assignments", target.table),
        ));
    }
    let mut w = SqlWriter::new(dialect);
    let set = assignments.render(&mut w)?;
    let mut sql = format!("UPDATE {} SET {set}", w.ident(target.table));
    if let Some(cond) = spec.render_where(&mut w, target, true)? {
        sql.push_str(" WHERE ");
        sql.push_str(&cond);
    }
    Ok(w.finish(sql))
}

/// `DELETE FROM ... WHERE ...`; refuses to run without user conditions.
pub fn build_delete(spec: &SelectSpec, target: &Target<'_>, dialect: Dialect) -> Result<Statement> {
    if !spec.has_conditions() {
        return Err(missing_where("DELETE", target.table));
    }
    let mut w = SqlWriter::new(dialect);
    let mut sql = format!("DELETE FROM {}", w.ident(target.table));
    if let Some(cond) = spec.render_where(&mut w, target, true)? {
        sql.push_str(" WHERE ");
        sql.push_str(&cond);
    }
    Ok(w.finish(sql))
}

/// Stamp the soft-delete column instead of removing rows.
pub fn build_soft_delete(
    spec: &SelectSpec,
    target: &Target<'_>,
    dialect: Dialect,
    deleted_at: Value,
) -> Result<Statement> {
    let Some(column) = target.soft_delete else {
        return build_delete(spec, target, dialect);
    };
    build_update(
        spec,
        target,
        dialect,
        &Assignments::new().set(column, deleted_at),
    )
}
