//! Field and column definitions.

use crate::value::Value;

/// SQL data types a column can be declared with.
///
/// Only consumed by the migration boundary; the query path never needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    SmallInt,
    Integer,
    BigInt,
    Double,
    Decimal { precision: u8, scale: u8 },
    Boolean,
    VarChar(u32),
    Text,
    Blob,
    Date,
    Timestamp,
    Uuid,
    Json,
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({precision}, {scale})"),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({len})"),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
        }
    }
}

/// How an auto-maintained timestamp column stores "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    /// `Value::Timestamp` (microseconds since epoch)
    Timestamp,
    /// Unix seconds as `Value::BigInt`
    Seconds,
    /// Unix milliseconds as `Value::BigInt`
    Millis,
    /// Unix nanoseconds as `Value::BigInt`
    Nanos,
}

impl TimeUnit {
    /// Render a point in time, given as nanoseconds since the epoch.
    pub fn value_at(self, unix_nanos: i64) -> Value {
        match self {
            TimeUnit::Timestamp => Value::Timestamp(unix_nanos / 1_000),
            TimeUnit::Seconds => Value::BigInt(unix_nanos / 1_000_000_000),
            TimeUnit::Millis => Value::BigInt(unix_nanos / 1_000_000),
            TimeUnit::Nanos => Value::BigInt(unix_nanos),
        }
    }
}

/// Metadata about a record field and the column it maps to.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Database column name (may differ from field name)
    pub column_name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    /// Store-assigned key; a zero value means "not yet inserted"
    pub auto_increment: bool,
    /// Written on insert, never included in updates
    pub create_only: bool,
    /// Set to "now" on insert when still zero
    pub auto_create_time: Option<TimeUnit>,
    /// Set to "now" on every insert and update
    pub auto_update_time: Option<TimeUnit>,
    /// Deletes stamp this column instead of removing the row
    pub soft_delete: Option<TimeUnit>,
    /// Not persisted at all
    pub excluded: bool,
}

impl FieldInfo {
    /// Create a new field info with minimal required data.
    pub const fn new(name: &'static str, column_name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column_name,
            sql_type,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            create_only: false,
            auto_create_time: None,
            auto_update_time: None,
            soft_delete: None,
            excluded: false,
        }
    }

    /// Set the database column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column_name = name;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    pub const fn create_only(mut self, value: bool) -> Self {
        self.create_only = value;
        self
    }

    pub const fn auto_create_time(mut self, unit: TimeUnit) -> Self {
        self.auto_create_time = Some(unit);
        self
    }

    pub const fn auto_update_time(mut self, unit: TimeUnit) -> Self {
        self.auto_update_time = Some(unit);
        self
    }

    /// Mark this nullable column as the soft-delete marker.
    pub const fn soft_delete(mut self, unit: TimeUnit) -> Self {
        self.soft_delete = Some(unit);
        self.nullable = true;
        self
    }

    pub const fn excluded(mut self, value: bool) -> Self {
        self.excluded = value;
        self
    }

    /// Is this column written by INSERT statements?
    pub const fn is_insertable(&self) -> bool {
        !self.excluded
    }

    /// Is this column written by UPDATE statements?
    pub const fn is_updatable(&self) -> bool {
        !self.excluded && !self.create_only && !self.primary_key
    }
}
