//! SQL dialect selection and identifier handling.
//!
//! A dialect only decides placeholder style, identifier quoting and a few
//! clause spellings; statements are otherwise rendered the same everywhere.

use std::sync::OnceLock;

use regex::Regex;

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect, doubling embedded quote characters.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", name.replace('"', "\"\"")),
            Dialect::Mysql => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// Quote `table.column`.
    pub fn qualified(self, table: &str, column: &str) -> String {
        format!(
            "{}.{}",
            self.quote_identifier(table),
            self.quote_identifier(column)
        )
    }

    /// Can INSERT statements return generated columns with `RETURNING`?
    pub const fn supports_returning(self) -> bool {
        matches!(self, Dialect::Postgres | Dialect::Sqlite)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
            Dialect::Mysql => "mysql",
        }
    }
}

fn identifier_regex() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

fn qualified_regex() -> Option<&'static Regex> {
    static QUALIFIED: OnceLock<Option<Regex>> = OnceLock::new();
    QUALIFIED
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Is `name` a plain SQL identifier (letters, digits, underscore)?
pub fn is_plain_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

/// Is `name` a `table.column` pair of plain identifiers?
pub fn is_qualified_identifier(name: &str) -> bool {
    qualified_regex().is_some_and(|re| re.is_match(name))
}
