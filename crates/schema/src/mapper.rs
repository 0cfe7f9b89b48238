//! Maps source attribute declarations to destination column types.
//!
//! Pure and stateless; one mapping table per SQL family. Every destination
//! table additionally carries an `id` primary key plus `created_at` /
//! `updated_at` timestamps, and the warehouse append-only and immutable
//! modes add their tracking columns.

use crate::dialect::SqlFamily;
use model::core::attribute::{AttributeDecl, AttributeType};
use serde::{Deserialize, Serialize};

/// A destination column derived from a source attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    /// Rendered verbatim into DDL when present (e.g. `NOW()`).
    pub default: Option<String>,
}

impl ColumnSpec {
    fn new(name: &str, sql_type: impl Into<String>, nullable: bool) -> Self {
        ColumnSpec {
            name: name.to_string(),
            sql_type: sql_type.into(),
            nullable,
            default: None,
        }
    }

    fn with_default(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }
}

/// Tracking columns implied by the warehouse mutability mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingColumns {
    #[default]
    None,
    /// `_operation_type`, `_operation_timestamp`.
    AppendOnly,
    /// Append-only columns plus `_is_deleted`, `_version`.
    Immutable,
}

/// Maps one attribute declaration to the destination column type.
pub fn sql_type(ty: &AttributeType, family: SqlFamily) -> String {
    use AttributeType::*;
    match family {
        SqlFamily::Postgres => match ty {
            String { max_length: Some(n) } => format!("VARCHAR({n})"),
            String { max_length: None } | Secret => "TEXT".into(),
            Number => "DOUBLE PRECISION".into(),
            Boolean => "BOOLEAN".into(),
            Json | Object | Array | Embedding(_) => "JSONB".into(),
            Ip4 | Ip6 => "INET".into(),
            Uuid => "UUID".into(),
            Date => "DATE".into(),
            DateTime => "TIMESTAMPTZ".into(),
        },
        SqlFamily::MySql => match ty {
            String { max_length: Some(n) } => format!("VARCHAR({n})"),
            String { max_length: None } | Secret => "TEXT".into(),
            Number => "DOUBLE".into(),
            Boolean => "TINYINT(1)".into(),
            Json | Object | Array | Embedding(_) => "JSON".into(),
            Ip4 => "VARCHAR(15)".into(),
            Ip6 => "VARCHAR(45)".into(),
            Uuid => "CHAR(36)".into(),
            Date => "DATE".into(),
            DateTime => "DATETIME".into(),
        },
        SqlFamily::BigQuery => match ty {
            String { .. } | Secret | Ip4 | Ip6 | Uuid => "STRING".into(),
            Number => "FLOAT64".into(),
            Boolean => "BOOL".into(),
            Json | Object | Array | Embedding(_) => "JSON".into(),
            Date => "DATE".into(),
            DateTime => "TIMESTAMP".into(),
        },
        SqlFamily::Sqlite => match ty {
            String { .. } | Secret | Ip4 | Ip6 | Uuid | Date | DateTime => "TEXT".into(),
            Number => "REAL".into(),
            Boolean => "INTEGER".into(),
            Json | Object | Array | Embedding(_) => "TEXT".into(),
        },
    }
}

fn id_column(family: SqlFamily) -> ColumnSpec {
    let sql_type = match family {
        SqlFamily::Postgres | SqlFamily::Sqlite => "TEXT",
        SqlFamily::MySql => "VARCHAR(255)",
        SqlFamily::BigQuery => "STRING",
    };
    ColumnSpec::new("id", sql_type, false)
}

fn timestamp_columns(family: SqlFamily) -> Vec<ColumnSpec> {
    let (sql_type, default) = match family {
        SqlFamily::Postgres => ("TIMESTAMPTZ", "NOW()"),
        SqlFamily::MySql => ("DATETIME", "CURRENT_TIMESTAMP"),
        SqlFamily::BigQuery => ("TIMESTAMP", "CURRENT_TIMESTAMP()"),
        SqlFamily::Sqlite => ("TEXT", "CURRENT_TIMESTAMP"),
    };
    vec![
        ColumnSpec::new("created_at", sql_type, false).with_default(default),
        ColumnSpec::new("updated_at", sql_type, false).with_default(default),
    ]
}

fn tracking_column_specs(tracking: TrackingColumns, family: SqlFamily) -> Vec<ColumnSpec> {
    let string_ty = match family {
        SqlFamily::Postgres | SqlFamily::Sqlite => "TEXT",
        SqlFamily::MySql => "VARCHAR(16)",
        SqlFamily::BigQuery => "STRING",
    };
    let ts_ty = match family {
        SqlFamily::Postgres => "TIMESTAMPTZ",
        SqlFamily::MySql => "DATETIME",
        SqlFamily::BigQuery => "TIMESTAMP",
        SqlFamily::Sqlite => "TEXT",
    };
    let bool_ty = match family {
        SqlFamily::Postgres => "BOOLEAN",
        SqlFamily::MySql => "TINYINT(1)",
        SqlFamily::BigQuery => "BOOL",
        SqlFamily::Sqlite => "INTEGER",
    };
    let int_ty = match family {
        SqlFamily::Postgres | SqlFamily::Sqlite => "BIGINT",
        SqlFamily::MySql => "BIGINT",
        SqlFamily::BigQuery => "INT64",
    };

    match tracking {
        TrackingColumns::None => vec![],
        TrackingColumns::AppendOnly => vec![
            ColumnSpec::new("_operation_type", string_ty, false),
            ColumnSpec::new("_operation_timestamp", ts_ty, false),
        ],
        TrackingColumns::Immutable => vec![
            ColumnSpec::new("_operation_type", string_ty, false),
            ColumnSpec::new("_operation_timestamp", ts_ty, false),
            ColumnSpec::new("_is_deleted", bool_ty, false),
            ColumnSpec::new("_version", int_ty, false),
        ],
    }
}

/// Computes the full expected column set for a destination table.
///
/// Order: `id`, payload columns in declaration order, timestamps, then
/// any tracking columns. Attribute columns named `id` are folded into the
/// primary key rather than duplicated.
pub fn table_columns(
    attrs: &[AttributeDecl],
    family: SqlFamily,
    tracking: TrackingColumns,
) -> Vec<ColumnSpec> {
    let mut columns = vec![id_column(family)];

    for attr in attrs {
        if attr.name == "id" {
            continue;
        }
        columns.push(ColumnSpec::new(
            &attr.name,
            sql_type(&attr.ty, family),
            !attr.required,
        ));
    }

    columns.extend(timestamp_columns(family));
    columns.extend(tracking_column_specs(tracking, family));
    columns
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(name: &str, decl: &str) -> AttributeDecl {
        AttributeDecl::parse(name, decl).unwrap()
    }

    #[test]
    fn maps_per_dialect_as_specified() {
        let cases = [
            ("string", SqlFamily::Postgres, "TEXT"),
            ("string|maxlength:80", SqlFamily::Postgres, "VARCHAR(80)"),
            ("string|maxlength:80", SqlFamily::MySql, "VARCHAR(80)"),
            ("string|maxlength:80", SqlFamily::BigQuery, "STRING"),
            ("number", SqlFamily::Postgres, "DOUBLE PRECISION"),
            ("number", SqlFamily::MySql, "DOUBLE"),
            ("number", SqlFamily::BigQuery, "FLOAT64"),
            ("boolean", SqlFamily::MySql, "TINYINT(1)"),
            ("json", SqlFamily::Postgres, "JSONB"),
            ("embedding:768", SqlFamily::MySql, "JSON"),
            ("ip4", SqlFamily::Postgres, "INET"),
            ("ip4", SqlFamily::MySql, "VARCHAR(15)"),
            ("ip6", SqlFamily::MySql, "VARCHAR(45)"),
            ("uuid", SqlFamily::Postgres, "UUID"),
            ("uuid", SqlFamily::MySql, "CHAR(36)"),
            ("uuid", SqlFamily::BigQuery, "STRING"),
            ("datetime", SqlFamily::Postgres, "TIMESTAMPTZ"),
            ("datetime", SqlFamily::MySql, "DATETIME"),
            ("datetime", SqlFamily::BigQuery, "TIMESTAMP"),
            ("secret", SqlFamily::Postgres, "TEXT"),
        ];
        for (decl, family, expected) in cases {
            let parsed = attr("x", decl);
            assert_eq!(sql_type(&parsed.ty, family), expected, "{decl} on {family:?}");
        }
    }

    #[test]
    fn table_columns_carry_standard_auxiliaries() {
        let attrs = vec![attr("email", "string|required"), attr("name", "string")];
        let cols = table_columns(&attrs, SqlFamily::Postgres, TrackingColumns::None);
        let names: Vec<_> = cols.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "email", "name", "created_at", "updated_at"]);
        assert!(!cols[0].nullable);
        assert!(!cols[1].nullable, "required attribute is NOT NULL");
        assert!(cols[2].nullable);
        assert_eq!(cols[3].default.as_deref(), Some("NOW()"));
    }

    #[test]
    fn id_attribute_is_not_duplicated() {
        let attrs = vec![attr("id", "string"), attr("email", "string")];
        let cols = table_columns(&attrs, SqlFamily::MySql, TrackingColumns::None);
        assert_eq!(cols.iter().filter(|c| c.name == "id").count(), 1);
    }

    #[test]
    fn immutable_mode_adds_all_tracking_columns() {
        let cols = table_columns(&[], SqlFamily::BigQuery, TrackingColumns::Immutable);
        let names: Vec<_> = cols.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"_operation_type"));
        assert!(names.contains(&"_operation_timestamp"));
        assert!(names.contains(&"_is_deleted"));
        assert!(names.contains(&"_version"));
        let version = cols.iter().find(|c| c.name == "_version").unwrap();
        assert_eq!(version.sql_type, "INT64");
    }

    #[test]
    fn append_only_mode_omits_version_columns() {
        let cols = table_columns(&[], SqlFamily::BigQuery, TrackingColumns::AppendOnly);
        let names: Vec<_> = cols.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"_operation_type"));
        assert!(!names.contains(&"_is_deleted"));
        assert!(!names.contains(&"_version"));
    }
}
