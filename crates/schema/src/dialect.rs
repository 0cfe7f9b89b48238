//! Database-specific SQL syntax for destination DDL and DML.

use serde::{Deserialize, Serialize};

/// The SQL family a destination speaks; selects the type-mapping column
/// of the attribute table and the identifier/placeholder syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlFamily {
    Postgres,
    MySql,
    BigQuery,
    Sqlite,
}

pub trait Dialect: Send + Sync {
    /// Wraps a table or column name in the dialect's quotation marks.
    fn quote_identifier(&self, ident: &str) -> String;

    /// Placeholder for the parameter at `index` (0-based).
    fn placeholder(&self, index: usize) -> String;

    /// Expression yielding the current timestamp.
    fn now_expr(&self) -> &'static str;

    fn family(&self) -> SqlFamily;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
pub struct Postgres;

impl Dialect for Postgres {
    fn quote_identifier(&self, ident: &str) -> String {
        format!(r#""{ident}""#)
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index + 1)
    }

    fn now_expr(&self) -> &'static str {
        "NOW()"
    }

    fn family(&self) -> SqlFamily {
        SqlFamily::Postgres
    }

    fn name(&self) -> &'static str {
        "PostgreSQL"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MySql;

impl Dialect for MySql {
    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{ident}`")
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn now_expr(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }

    fn family(&self) -> SqlFamily {
        SqlFamily::MySql
    }

    fn name(&self) -> &'static str {
        "MySQL"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BigQuery;

impl Dialect for BigQuery {
    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{ident}`")
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn now_expr(&self) -> &'static str {
        "CURRENT_TIMESTAMP()"
    }

    fn family(&self) -> SqlFamily {
        SqlFamily::BigQuery
    }

    fn name(&self) -> &'static str {
        "BigQuery"
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Sqlite;

impl Dialect for Sqlite {
    fn quote_identifier(&self, ident: &str) -> String {
        format!(r#""{ident}""#)
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn now_expr(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }

    fn family(&self) -> SqlFamily {
        SqlFamily::Sqlite
    }

    fn name(&self) -> &'static str {
        "SQLite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_and_placeholders() {
        assert_eq!(Postgres.quote_identifier("users"), r#""users""#);
        assert_eq!(Postgres.placeholder(0), "$1");
        assert_eq!(MySql.quote_identifier("users"), "`users`");
        assert_eq!(MySql.placeholder(5), "?");
        assert_eq!(BigQuery.now_expr(), "CURRENT_TIMESTAMP()");
    }
}
