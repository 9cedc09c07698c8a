//! WHERE conditions.
//!
//! A query accumulates [`Term`]s; each pairs a [`Condition`] with the
//! [`Connector`] that joins it to everything before it. Terms are combined
//! strictly left to right.

use std::collections::BTreeMap;

use relmap_core::{Error, Model, Result, Value};

use crate::writer::SqlWriter;

/// A single condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Raw SQL fragment with `?` placeholders.
    Raw {
        fragment: String,
        params: Vec<Value>,
    },
    /// Equality over the non-zero fields of a record.
    FieldEquality { pairs: Vec<(&'static str, Value)> },
    /// Equality over every key of a map, zero values included.
    KeyedEquality(BTreeMap<String, Value>),
}

impl Condition {
    pub fn raw(fragment: impl Into<String>, params: Vec<Value>) -> Self {
        Condition::Raw {
            fragment: fragment.into(),
            params,
        }
    }

    /// Build an equality condition from a record's non-zero persisted fields.
    ///
    /// Zero-valued fields (`0`, `""`, `false`, `NULL`) are skipped, so a record
    /// cannot be used to match on them; use [`Condition::from_map`] for that.
    pub fn from_record<M: Model>(record: &M) -> Self {
        let fields = M::fields();
        let pairs = record
            .to_row()
            .into_iter()
            .filter(|(column, value)| {
                !value.is_zero()
                    && fields
                        .iter()
                        .find(|f| f.column_name == *column)
                        .is_none_or(|f| f.is_insertable())
            })
            .collect();
        Condition::FieldEquality { pairs }
    }

    /// Build an equality condition from `column -> value` pairs.
    ///
    /// A `NULL` value renders `IS NULL`; an `Array` value renders `IN (...)`.
    pub fn from_map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Condition::KeyedEquality(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a keyed condition from a JSON object.
    pub fn from_json(object: serde_json::Value) -> Result<Self> {
        match object {
            serde_json::Value::Object(map) => Ok(Condition::KeyedEquality(
                map.into_iter()
                    .map(|(k, v)| (k, json_to_value(v)))
                    .collect(),
            )),
            other => Err(Error::Custom(format!(
                "keyed condition must be a JSON object, got {other}"
            ))),
        }
    }

    /// Does this condition render no SQL at all?
    pub fn is_empty(&self) -> bool {
        match self {
            Condition::Raw { fragment, .. } => fragment.trim().is_empty(),
            Condition::FieldEquality { pairs } => pairs.is_empty(),
            Condition::KeyedEquality(map) => map.is_empty(),
        }
    }

    /// Render this condition; `table` qualifies struct and map columns.
    pub fn render(&self, w: &mut SqlWriter, table: &str) -> Result<String> {
        match self {
            Condition::Raw { fragment, params } => w.fragment(fragment, params),
            Condition::FieldEquality { pairs } => Ok(pairs
                .iter()
                .map(|(column, value)| equality(w, table, column, value))
                .collect::<Vec<_>>()
                .join(" AND ")),
            Condition::KeyedEquality(map) => Ok(map
                .iter()
                .map(|(column, value)| equality(w, table, column, value))
                .collect::<Vec<_>>()
                .join(" AND ")),
        }
    }
}

fn equality(w: &mut SqlWriter, table: &str, column: &str, value: &Value) -> String {
    let target = if column.contains('.') {
        column
            .split_once('.')
            .map_or_else(|| w.ident(column), |(t, c)| w.qualified(t, c))
    } else {
        w.qualified(table, column)
    };
    match value {
        Value::Null => format!("{target} IS NULL"),
        Value::Array(items) => format!("{target} IN ({})", w.bind_list(items)),
        other => format!("{target} = {}", w.bind(other.clone())),
    }
}

/// Convert a JSON scalar or array into a bindable value.
pub fn json_to_value(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::BigInt(i),
            None => n.as_f64().map_or(Value::Null, Value::Double),
        },
        serde_json::Value::String(s) => Value::Text(s),
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(json_to_value).collect())
        }
        object @ serde_json::Value::Object(_) => Value::Json(object),
    }
}

/// How a term joins the expression accumulated before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub connector: Connector,
    pub condition: Condition,
}

/// Render terms left to right into one boolean expression.
///
/// Each term is parenthesized once more than one term is present, and the
/// accumulated expression is parenthesized whenever the operator changes, so
/// `a AND b OR c` renders as `((a) AND (b)) OR (c)`. Returns `None` when no
/// term produces any SQL.
pub fn render_terms(w: &mut SqlWriter, terms: &[Term], table: &str) -> Result<Option<String>> {
    let mut rendered = Vec::with_capacity(terms.len());
    for term in terms {
        if term.condition.is_empty() {
            continue;
        }
        rendered.push((term.connector, term.condition.render(w, table)?));
    }

    if let [(connector, sql)] = rendered.as_slice() {
        return Ok(Some(match connector {
            Connector::Not => format!("NOT ({sql})"),
            Connector::And | Connector::Or => sql.clone(),
        }));
    }

    let mut acc: Option<String> = None;
    let mut acc_op: Option<&str> = None;
    for (connector, sql) in rendered {
        let atom = match connector {
            Connector::Not => format!("NOT ({sql})"),
            Connector::And | Connector::Or => format!("({sql})"),
        };
        let Some(current) = acc.take() else {
            acc = Some(atom);
            continue;
        };
        let op = match connector {
            Connector::Or => "OR",
            Connector::And | Connector::Not => "AND",
        };
        let left = match acc_op {
            Some(prev) if prev != op => format!("({current})"),
            _ => current,
        };
        acc = Some(format!("{left} {op} {atom}"));
        acc_op = Some(op);
    }
    Ok(acc)
}
