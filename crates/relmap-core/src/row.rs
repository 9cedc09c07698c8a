//! Result rows and typed decoding.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    ///
    /// When a name repeats (e.g. `SELECT users.*, wallets.*`), lookups by name
    /// resolve to the first occurrence.
    pub fn new(names: Vec<String>) -> Self {
        let mut name_to_index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            name_to_index.entry(name.clone()).or_insert(i);
        }
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from the executor.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let (names, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self::new(names, values)
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.index_of(name).is_some()
    }

    /// Get a typed value by column index.
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.get(index).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("index {index} out of bounds ({} columns)", self.len()),
                column: None,
                rust_type: None,
            })
        })?;
        T::from_value(value)
    }

    /// Get a typed value by column name.
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{name}' not found"),
                column: Some(name.to_string()),
                rust_type: None,
            })
        })?;
        T::from_value(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    /// Get a typed value by name, falling back to the type's zero value when
    /// the column was not projected or holds NULL.
    ///
    /// Decoders use this so a narrowed `select(...)` leaves the missing fields
    /// at their defaults instead of failing.
    pub fn get_or_default<T: FromValue + Default>(&self, name: &str) -> Result<T> {
        match self.get_by_name(name) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(_) => self.get_named(name),
        }
    }

    /// Columns whose name starts with `prefix`, with the prefix stripped.
    ///
    /// Joined relations are selected as `"<Relation>__<column>"`; this turns
    /// such a row back into one the related model can decode.
    pub fn subset_by_prefix(&self, prefix: &str) -> Row {
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (name, value) in self.iter() {
            if let Some(stripped) = name.strip_prefix(prefix) {
                names.push(stripped.to_string());
                values.push(value.clone());
            }
        }
        Row::new(names, values)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names().zip(self.values.iter())
    }
}

/// Decode a whole row into a non-model destination (projections, aggregates).
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

/// Trait for converting from a `Value` to a typed value.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
        rust_type: None,
    })
}

fn out_of_range(expected: &'static str, v: i64) -> Error {
    Error::Type(TypeError {
        expected,
        actual: format!("value {v} out of range"),
        column: None,
        rust_type: None,
    })
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch("bool", value))
    }
}

impl FromValue for i16 {
    fn from_value(value: &Value) -> Result<Self> {
        let v = value.as_i64().ok_or_else(|| mismatch("i16", value))?;
        i16::try_from(v).map_err(|_| out_of_range("i16", v))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let v = value.as_i64().ok_or_else(|| mismatch("i32", value))?;
        i32::try_from(v).map_err(|_| out_of_range("i32", v))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch("i64", value))
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Result<Self> {
        let v = value.as_i64().ok_or_else(|| mismatch("u32", value))?;
        u32::try_from(v).map_err(|_| out_of_range("u32", v))
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self> {
        let v = value.as_i64().ok_or_else(|| mismatch("u64", value))?;
        u64::try_from(v).map_err(|_| out_of_range("u64", v))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch("f64", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s.clone()),
            _ => Err(mismatch("String", value)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(mismatch("Vec<u8>", value)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Json(v) => Ok(v.clone()),
            Value::Text(s) => serde_json::from_str(s).map_err(|e| {
                Error::Type(TypeError {
                    expected: "valid JSON",
                    actual: format!("invalid JSON: {e}"),
                    column: None,
                    rust_type: None,
                })
            }),
            _ => Err(mismatch("JSON", value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access_and_errors() {
        let row = Row::new(
            vec!["id".to_string(), "name".to_string()],
            vec![Value::Int(42), Value::Text("Bob".to_string())],
        );
        assert_eq!(row.get_as::<i64>(0).unwrap(), 42);
        assert_eq!(row.get_named::<String>("name").unwrap(), "Bob");
        assert!(row.get_named::<i32>("name").is_err());
        assert!(row.get_named::<i32>("missing").is_err());
        assert!(row.get_as::<i32>(9).is_err());
    }

    #[test]
    fn type_error_names_the_column() {
        let row = Row::new(vec!["age".to_string()], vec![Value::Text("x".into())]);
        let err = row.get_named::<i64>("age").unwrap_err();
        match err {
            Error::Type(te) => assert_eq!(te.column.as_deref(), Some("age")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn get_or_default_tolerates_unprojected_columns() {
        let row = Row::new(
            vec!["id".to_string(), "middle".to_string()],
            vec![Value::Text("1".into()), Value::Null],
        );
        assert_eq!(row.get_or_default::<String>("id").unwrap(), "1");
        assert_eq!(row.get_or_default::<String>("password").unwrap(), "");
        assert_eq!(row.get_or_default::<String>("middle").unwrap(), "");
        assert_eq!(row.get_or_default::<i64>("balance").unwrap(), 0);
    }

    #[test]
    fn subset_by_prefix_strips_relation_alias() {
        let row = Row::from_pairs([
            ("id", Value::Text("u1".into())),
            ("Wallet__id", Value::Text("w1".into())),
            ("Wallet__balance", Value::BigInt(10)),
        ]);
        let wallet = row.subset_by_prefix("Wallet__");
        assert_eq!(wallet.len(), 2);
        assert_eq!(wallet.get_named::<String>("id").unwrap(), "w1");
        assert_eq!(wallet.get_named::<i64>("balance").unwrap(), 10);
    }

    #[test]
    fn duplicate_names_resolve_to_first() {
        let row = Row::new(
            vec!["id".to_string(), "id".to_string()],
            vec![Value::Int(1), Value::Int(2)],
        );
        assert_eq!(row.get_named::<i32>("id").unwrap(), 1);
        assert_eq!(row.values().count(), 2);
    }

    #[test]
    fn option_handles_null() {
        let row = Row::new(vec!["n".to_string()], vec![Value::Null]);
        assert_eq!(row.get_named::<Option<i32>>("n").unwrap(), None);
        assert!(row.get_named::<i32>("n").is_err());
    }
}
