//! Statement rendering with positional parameters.

use relmap_core::{Dialect, Error, QueryErrorKind, Result, Value};

/// A rendered statement: SQL text plus its parameters in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Collects parameters while statement text is assembled.
///
/// Every placeholder is numbered by the order its parameter was bound, so
/// callers must render clauses in the order they appear in the final text.
#[derive(Debug)]
pub struct SqlWriter {
    dialect: Dialect,
    params: Vec<Value>,
}

impl SqlWriter {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn ident(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    pub fn qualified(&self, table: &str, column: &str) -> String {
        self.dialect.qualified(table, column)
    }

    /// Bind one value and return its placeholder.
    pub fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    /// Bind each element and return the comma-separated placeholders.
    ///
    /// An empty list renders as `NULL`, so `x IN (NULL)` matches nothing.
    pub fn bind_list(&mut self, values: &[Value]) -> String {
        if values.is_empty() {
            return "NULL".to_string();
        }
        values
            .iter()
            .map(|v| self.bind(v.clone()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Render a condition fragment, replacing each `?` outside quoted text with
    /// a dialect placeholder.
    ///
    /// An `Array` parameter expands to one placeholder per element and is
    /// parenthesized unless the `?` already sits between parentheses.
    pub fn fragment(&mut self, fragment: &str, params: &[Value]) -> Result<String> {
        let expected = count_placeholders(fragment);
        if expected != params.len() {
            return Err(Error::query(
                QueryErrorKind::ParameterMismatch,
                format!(
                    "`{fragment}` has {expected} placeholder(s) but {} parameter(s) were bound",
                    params.len()
                ),
            ));
        }

        let chars: Vec<char> = fragment.chars().collect();
        let mut out = String::with_capacity(fragment.len() + params.len() * 2);
        let mut params = params.iter();
        let mut quote: Option<char> = None;

        for (i, &c) in chars.iter().enumerate() {
            if let Some(q) = quote {
                out.push(c);
                if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                }
                '?' => match params.next() {
                    Some(Value::Array(items)) => {
                        let list = self.bind_list(items);
                        let before = chars[..i].iter().rev().find(|c| !c.is_whitespace());
                        let after = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                        if before == Some(&'(') && after == Some(&')') {
                            out.push_str(&list);
                        } else {
                            out.push('(');
                            out.push_str(&list);
                            out.push(')');
                        }
                    }
                    Some(value) => {
                        let placeholder = self.bind(value.clone());
                        out.push_str(&placeholder);
                    }
                    None => {
                        return Err(Error::query(
                            QueryErrorKind::ParameterMismatch,
                            format!("`{fragment}` ran out of parameters"),
                        ));
                    }
                },
                _ => out.push(c),
            }
        }
        Ok(out)
    }

    pub fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

/// Count `?` placeholders outside quoted text.
pub fn count_placeholders(fragment: &str) -> usize {
    let mut quote: Option<char> = None;
    let mut count = 0;
    for c in fragment.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' | '`' => quote = Some(c),
                '?' => count += 1,
                _ => {}
            },
        }
    }
    count
}
