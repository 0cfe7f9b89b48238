//! Parameterised DML construction shared by the SQL drivers.
//!
//! Values are never interpolated into statement text; every record field
//! becomes a bind parameter. Inserts are upserts keyed on `id` so
//! at-least-once redelivery stays idempotent.

use crate::sql::value::SqlValue;
use model::core::record::Record;
use schema::dialect::{Dialect, SqlFamily};

#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

fn data_columns(record: &Record) -> Vec<(&String, SqlValue)> {
    record
        .iter()
        .map(|(name, value)| (name, SqlValue::from_json(value)))
        .collect()
}

pub fn insert(dialect: &dyn Dialect, table: &str, record: &Record) -> Statement {
    let columns = data_columns(record);
    let now = dialect.now_expr();

    let mut col_names: Vec<String> = columns
        .iter()
        .map(|(name, _)| dialect.quote_identifier(name))
        .collect();
    col_names.push(dialect.quote_identifier("created_at"));
    col_names.push(dialect.quote_identifier("updated_at"));

    let mut placeholders: Vec<String> = (0..columns.len())
        .map(|i| dialect.placeholder(i))
        .collect();
    placeholders.push(now.to_string());
    placeholders.push(now.to_string());

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.quote_identifier(table),
        col_names.join(", "),
        placeholders.join(", ")
    );

    let update_cols: Vec<&String> = columns
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| name.as_str() != "id")
        .collect();

    match dialect.family() {
        SqlFamily::Postgres | SqlFamily::Sqlite => {
            let mut sets: Vec<String> = update_cols
                .iter()
                .map(|name| {
                    let quoted = dialect.quote_identifier(name);
                    format!("{quoted} = EXCLUDED.{quoted}")
                })
                .collect();
            sets.push(format!("{} = {now}", dialect.quote_identifier("updated_at")));
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                dialect.quote_identifier("id"),
                sets.join(", ")
            ));
        }
        SqlFamily::MySql => {
            let mut sets: Vec<String> = update_cols
                .iter()
                .map(|name| {
                    let quoted = dialect.quote_identifier(name);
                    format!("{quoted} = VALUES({quoted})")
                })
                .collect();
            sets.push(format!("{} = {now}", dialect.quote_identifier("updated_at")));
            sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {}", sets.join(", ")));
        }
        SqlFamily::BigQuery => {}
    }

    Statement {
        sql,
        params: columns.into_iter().map(|(_, value)| value).collect(),
    }
}

pub fn update(dialect: &dyn Dialect, table: &str, record_id: &str, record: &Record) -> Statement {
    let columns: Vec<(&String, SqlValue)> = data_columns(record)
        .into_iter()
        .filter(|(name, _)| name.as_str() != "id")
        .collect();
    let now = dialect.now_expr();

    let mut sets: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, (name, _))| format!("{} = {}", dialect.quote_identifier(name), dialect.placeholder(i)))
        .collect();
    sets.push(format!("{} = {now}", dialect.quote_identifier("updated_at")));

    let sql = format!(
        "UPDATE {} SET {} WHERE {} = {}",
        dialect.quote_identifier(table),
        sets.join(", "),
        dialect.quote_identifier("id"),
        dialect.placeholder(columns.len())
    );

    let mut params: Vec<SqlValue> = columns.into_iter().map(|(_, value)| value).collect();
    params.push(SqlValue::Text(record_id.to_string()));

    Statement { sql, params }
}

pub fn delete(dialect: &dyn Dialect, table: &str, record_id: &str) -> Statement {
    Statement {
        sql: format!(
            "DELETE FROM {} WHERE {} = {}",
            dialect.quote_identifier(table),
            dialect.quote_identifier("id"),
            dialect.placeholder(0)
        ),
        params: vec![SqlValue::Text(record_id.to_string())],
    }
}

/// Secondary audit row, written in the same transaction as the data row
/// when a `log_table` is configured.
pub fn audit_insert(
    dialect: &dyn Dialect,
    log_table: &str,
    entry_id: &str,
    resource: &str,
    record_id: &str,
    operation: &str,
    payload: Option<&Record>,
) -> Statement {
    let columns = ["id", "resource", "record_id", "operation", "payload", "occurred_at"];
    let quoted: Vec<String> = columns
        .iter()
        .map(|c| dialect.quote_identifier(c))
        .collect();
    let mut placeholders: Vec<String> = (0..5).map(|i| dialect.placeholder(i)).collect();
    placeholders.push(dialect.now_expr().to_string());

    Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            dialect.quote_identifier(log_table),
            quoted.join(", "),
            placeholders.join(", ")
        ),
        params: vec![
            SqlValue::Text(entry_id.to_string()),
            SqlValue::Text(resource.to_string()),
            SqlValue::Text(record_id.to_string()),
            SqlValue::Text(operation.to_string()),
            payload
                .map(|r| SqlValue::Json(serde_json::Value::Object(r.clone())))
                .unwrap_or(SqlValue::Null),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::core::record::as_record;
    use schema::dialect::{MySql, Postgres};
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        as_record(value).unwrap()
    }

    #[test]
    fn postgres_insert_is_parameterised_upsert() {
        let rec = record(json!({"email": "a@b", "id": "u1", "name": "A"}));
        let stmt = insert(&Postgres, "users_table", &rec);
        assert_eq!(
            stmt.sql,
            r#"INSERT INTO "users_table" ("email", "id", "name", "created_at", "updated_at") VALUES ($1, $2, $3, NOW(), NOW()) ON CONFLICT ("id") DO UPDATE SET "email" = EXCLUDED."email", "name" = EXCLUDED."name", "updated_at" = NOW()"#
        );
        assert_eq!(stmt.params.len(), 3);
        assert!(!stmt.sql.contains("a@b"), "values never interpolated");
    }

    #[test]
    fn mysql_insert_uses_duplicate_key_clause() {
        let rec = record(json!({"id": "u1", "total": 42.0}));
        let stmt = insert(&MySql, "orders", &rec);
        assert!(stmt.sql.starts_with("INSERT INTO `orders` (`id`, `total`, `created_at`, `updated_at`) VALUES (?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)"));
        assert!(stmt.sql.contains("ON DUPLICATE KEY UPDATE `total` = VALUES(`total`)"));
    }

    #[test]
    fn update_binds_id_last() {
        let rec = record(json!({"id": "u1", "name": "B"}));
        let stmt = update(&Postgres, "users_table", "u1", &rec);
        assert_eq!(
            stmt.sql,
            r#"UPDATE "users_table" SET "name" = $1, "updated_at" = NOW() WHERE "id" = $2"#
        );
        assert_eq!(stmt.params.last(), Some(&SqlValue::Text("u1".into())));
    }

    #[test]
    fn delete_by_primary_key() {
        let stmt = delete(&Postgres, "users_table", "u1");
        assert_eq!(stmt.sql, r#"DELETE FROM "users_table" WHERE "id" = $1"#);
        assert_eq!(stmt.params, vec![SqlValue::Text("u1".into())]);
    }

    #[test]
    fn audit_row_carries_payload_snapshot() {
        let rec = record(json!({"id": "u1"}));
        let stmt = audit_insert(&Postgres, "audit_log", "e1", "users", "u1", "inserted", Some(&rec));
        assert!(stmt.sql.starts_with(r#"INSERT INTO "audit_log""#));
        assert_eq!(stmt.params.len(), 5);
        assert!(matches!(stmt.params[4], SqlValue::Json(_)));
    }
}
