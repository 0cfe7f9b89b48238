//! Renders DDL statements for schema sync.

use crate::{dialect::Dialect, mapper::ColumnSpec};

fn render_column(dialect: &dyn Dialect, col: &ColumnSpec) -> String {
    let mut out = format!("{} {}", dialect.quote_identifier(&col.name), col.sql_type);
    if !col.nullable {
        out.push_str(" NOT NULL");
    }
    if let Some(default) = &col.default {
        out.push_str(" DEFAULT ");
        out.push_str(default);
    }
    out
}

pub fn create_table(dialect: &dyn Dialect, table: &str, columns: &[ColumnSpec]) -> String {
    let mut defs: Vec<String> = columns.iter().map(|c| render_column(dialect, c)).collect();
    defs.push(format!("PRIMARY KEY ({})", dialect.quote_identifier("id")));
    format!(
        "CREATE TABLE {} ({})",
        dialect.quote_identifier(table),
        defs.join(", ")
    )
}

/// Added columns are always nullable with no default so existing rows
/// remain valid.
pub fn add_column(dialect: &dyn Dialect, table: &str, col: &ColumnSpec) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        dialect.quote_identifier(table),
        dialect.quote_identifier(&col.name),
        col.sql_type
    )
}

pub fn drop_column(dialect: &dyn Dialect, table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        dialect.quote_identifier(table),
        dialect.quote_identifier(column)
    )
}

pub fn drop_table(dialect: &dyn Dialect, table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", dialect.quote_identifier(table))
}
