//! ORDER BY and locking clauses.

use relmap_core::{Dialect, is_plain_identifier, is_qualified_identifier};

/// ORDER BY item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderBy {
    /// Passed through verbatim (e.g. `"age desc, name"`).
    Raw(String),
    /// A column with a direction; plain identifiers are quoted.
    Column {
        column: String,
        direction: OrderDirection,
    },
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderBy {
    /// Create an ascending order by clause.
    pub fn asc(column: impl Into<String>) -> Self {
        OrderBy::Column {
            column: column.into(),
            direction: OrderDirection::Asc,
        }
    }

    /// Create a descending order by clause.
    pub fn desc(column: impl Into<String>) -> Self {
        OrderBy::Column {
            column: column.into(),
            direction: OrderDirection::Desc,
        }
    }

    /// Generate SQL for this ORDER BY item.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        match self {
            OrderBy::Raw(sql) => sql.clone(),
            OrderBy::Column { column, direction } => {
                let mut sql = quote_column(dialect, column);
                sql.push_str(match direction {
                    OrderDirection::Asc => " ASC",
                    OrderDirection::Desc => " DESC",
                });
                sql
            }
        }
    }
}

impl From<&str> for OrderBy {
    fn from(sql: &str) -> Self {
        OrderBy::Raw(sql.to_string())
    }
}

impl From<String> for OrderBy {
    fn from(sql: String) -> Self {
        OrderBy::Raw(sql)
    }
}

/// Quote `column` or `table.column` when made of plain identifiers, otherwise
/// pass the expression through untouched.
pub fn quote_column(dialect: Dialect, column: &str) -> String {
    if is_plain_identifier(column) {
        dialect.quote_identifier(column)
    } else if is_qualified_identifier(column) {
        column
            .split_once('.')
            .map_or_else(|| column.to_string(), |(t, c)| dialect.qualified(t, c))
    } else {
        column.to_string()
    }
}

/// Row lock requested by a locking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// `FOR UPDATE`
    Update,
    /// `FOR SHARE`
    Share,
    /// `FOR UPDATE NOWAIT`
    UpdateNoWait,
    /// `FOR UPDATE SKIP LOCKED`
    UpdateSkipLocked,
}

impl LockMode {
    /// The locking clause for this dialect.
    ///
    /// SQLite has no row locks; the enclosing transaction is the lock, so no
    /// clause is rendered.
    pub fn to_sql(self, dialect: Dialect) -> Option<&'static str> {
        if dialect == Dialect::Sqlite {
            return None;
        }
        Some(match self {
            LockMode::Update => "FOR UPDATE",
            LockMode::Share => "FOR SHARE",
            LockMode::UpdateNoWait => "FOR UPDATE NOWAIT",
            LockMode::UpdateSkipLocked => "FOR UPDATE SKIP LOCKED",
        })
    }
}
