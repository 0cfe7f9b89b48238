//! Pure schema-plan construction: expected vs. actual column sets.

use crate::mapper::ColumnSpec;
use serde::{Deserialize, Serialize};

/// How a non-empty plan is applied to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStrategy {
    /// CREATE if missing, ALTER TABLE ADD COLUMN for additions; data preserved.
    #[default]
    Alter,
    /// DROP then CREATE; destination data is lost.
    DropCreate,
    /// Never mutates; mismatches are handled per `OnMismatch`.
    ValidateOnly,
}

/// Behaviour when validation finds a drifted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMismatch {
    /// Abort startup.
    Error,
    #[default]
    Warn,
    Ignore,
}

/// Options governing plan construction and application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    pub auto_create_table: bool,
    pub strategy: SyncStrategy,
    pub on_mismatch: OnMismatch,
    pub drop_missing_columns: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            auto_create_table: true,
            strategy: SyncStrategy::default(),
            on_mismatch: OnMismatch::default(),
            drop_missing_columns: false,
        }
    }
}

/// A column observed on the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualColumn {
    pub name: String,
    pub sql_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMismatch {
    pub name: String,
    pub expected: String,
    pub actual: String,
}

/// The migration steps required to align one destination table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaPlan {
    pub table_name: String,
    pub create_if_missing: bool,
    pub columns_to_add: Vec<ColumnSpec>,
    pub columns_to_drop: Vec<String>,
    pub columns_mismatch: Vec<ColumnMismatch>,
    pub strategy: SyncStrategy,
    pub on_mismatch: OnMismatch,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        !self.create_if_missing
            && self.columns_to_add.is_empty()
            && self.columns_to_drop.is_empty()
            && self.columns_mismatch.is_empty()
    }

    pub fn mismatch_details(&self) -> String {
        let mut parts = Vec::new();
        if self.create_if_missing {
            parts.push("table missing".to_string());
        }
        for col in &self.columns_to_add {
            parts.push(format!("missing column {}", col.name));
        }
        for m in &self.columns_mismatch {
            parts.push(format!(
                "column {} expected {} but found {}",
                m.name, m.expected, m.actual
            ));
        }
        parts.join("; ")
    }
}

/// Result of applying a plan, reported back on the event bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub created: bool,
    pub recreated: bool,
    pub added_columns: Vec<String>,
    pub dropped_columns: Vec<String>,
}

impl SchemaDiff {
    pub fn is_noop(&self) -> bool {
        !self.created
            && !self.recreated
            && self.added_columns.is_empty()
            && self.dropped_columns.is_empty()
    }
}

/// Type names compare case-insensitively with whitespace collapsed, and a
/// handful of well-known aliases normalise to the same token.
fn normalize_type(ty: &str) -> String {
    let collapsed: String = ty.split_whitespace().collect::<Vec<_>>().join(" ");
    let upper = collapsed.to_uppercase();
    match upper.as_str() {
        "TIMESTAMP WITH TIME ZONE" => "TIMESTAMPTZ".to_string(),
        "CHARACTER VARYING" => "VARCHAR".to_string(),
        "INT8" | "INT64" => "BIGINT".to_string(),
        "FLOAT8" => "DOUBLE PRECISION".to_string(),
        "BOOL" => "BOOLEAN".to_string(),
        other => {
            // `CHARACTER VARYING(80)` and friends keep their length suffix.
            if let Some(rest) = other.strip_prefix("CHARACTER VARYING") {
                format!("VARCHAR{rest}")
            } else {
                other.to_string()
            }
        }
    }
}

fn types_match(expected: &str, actual: &str) -> bool {
    normalize_type(expected) == normalize_type(actual)
}

/// Builds a plan from the expected column set and the introspected state.
///
/// Planning is idempotent: building against a table that already matches
/// the expected set yields an empty plan.
pub fn build_plan(
    table: &str,
    expected: &[ColumnSpec],
    actual: Option<&[ActualColumn]>,
    opts: &SyncOptions,
) -> SchemaPlan {
    let mut plan = SchemaPlan {
        table_name: table.to_string(),
        create_if_missing: false,
        columns_to_add: Vec::new(),
        columns_to_drop: Vec::new(),
        columns_mismatch: Vec::new(),
        strategy: opts.strategy,
        on_mismatch: opts.on_mismatch,
    };

    let Some(actual) = actual else {
        if opts.auto_create_table {
            plan.create_if_missing = true;
            plan.columns_to_add = expected.to_vec();
        }
        return plan;
    };

    for col in expected {
        match actual.iter().find(|a| a.name == col.name) {
            None => plan.columns_to_add.push(col.clone()),
            Some(found) => {
                if !types_match(&col.sql_type, &found.sql_type) {
                    plan.columns_mismatch.push(ColumnMismatch {
                        name: col.name.clone(),
                        expected: col.sql_type.clone(),
                        actual: found.sql_type.clone(),
                    });
                }
            }
        }
    }

    if opts.drop_missing_columns {
        for found in actual {
            if !expected.iter().any(|c| c.name == found.name) {
                plan.columns_to_drop.push(found.name.clone());
            }
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, sql_type: &str) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            nullable: true,
            default: None,
        }
    }

    fn actual(name: &str, sql_type: &str) -> ActualColumn {
        ActualColumn {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
        }
    }

    #[test]
    fn absent_table_plans_full_create() {
        let expected = vec![col("id", "TEXT"), col("email", "TEXT")];
        let plan = build_plan("users_table", &expected, None, &SyncOptions::default());
        assert!(plan.create_if_missing);
        assert_eq!(plan.columns_to_add.len(), 2);
        assert!(!plan.is_empty());
    }

    #[test]
    fn absent_table_without_auto_create_is_noop() {
        let opts = SyncOptions {
            auto_create_table: false,
            ..SyncOptions::default()
        };
        let plan = build_plan("t", &[col("id", "TEXT")], None, &opts);
        assert!(plan.is_empty());
    }

    #[test]
    fn missing_column_is_planned_as_addition() {
        let expected = vec![col("id", "TEXT"), col("email", "TEXT"), col("name", "TEXT")];
        let present = vec![actual("id", "TEXT"), actual("email", "TEXT")];
        let plan = build_plan("users_table", &expected, Some(&present), &SyncOptions::default());
        assert!(!plan.create_if_missing);
        assert_eq!(plan.columns_to_add.len(), 1);
        assert_eq!(plan.columns_to_add[0].name, "name");
        assert!(plan.columns_mismatch.is_empty());
    }

    #[test]
    fn type_drift_is_reported_as_mismatch() {
        let expected = vec![col("total", "DOUBLE PRECISION")];
        let present = vec![actual("total", "TEXT")];
        let plan = build_plan("orders", &expected, Some(&present), &SyncOptions::default());
        assert_eq!(plan.columns_mismatch.len(), 1);
        assert_eq!(plan.columns_mismatch[0].expected, "DOUBLE PRECISION");
    }

    #[test]
    fn type_aliases_do_not_mismatch() {
        let expected = vec![col("created_at", "TIMESTAMPTZ"), col("flag", "BOOLEAN")];
        let present = vec![
            actual("created_at", "timestamp with time zone"),
            actual("flag", "bool"),
        ];
        let plan = build_plan("t", &expected, Some(&present), &SyncOptions::default());
        assert!(plan.is_empty());
    }

    #[test]
    fn extra_columns_kept_unless_drop_requested() {
        let expected = vec![col("id", "TEXT")];
        let present = vec![actual("id", "TEXT"), actual("legacy", "TEXT")];

        let plan = build_plan("t", &expected, Some(&present), &SyncOptions::default());
        assert!(plan.columns_to_drop.is_empty());

        let opts = SyncOptions {
            drop_missing_columns: true,
            ..SyncOptions::default()
        };
        let plan = build_plan("t", &expected, Some(&present), &opts);
        assert_eq!(plan.columns_to_drop, vec!["legacy".to_string()]);
    }

    #[test]
    fn planning_twice_is_idempotent() {
        let expected = vec![col("id", "TEXT"), col("email", "VARCHAR(80)")];
        let present = vec![actual("id", "TEXT"), actual("email", "character varying(80)")];
        let first = build_plan("t", &expected, Some(&present), &SyncOptions::default());
        assert!(first.is_empty(), "aligned table yields an empty plan");

        // Simulate the state after applying a plan that added `email`.
        let before = vec![actual("id", "TEXT")];
        let plan = build_plan("t", &expected, Some(&before), &SyncOptions::default());
        assert_eq!(plan.columns_to_add.len(), 1);
        let after: Vec<ActualColumn> = expected
            .iter()
            .map(|c| actual(&c.name, &c.sql_type))
            .collect();
        let second = build_plan("t", &expected, Some(&after), &SyncOptions::default());
        assert!(second.is_empty());
    }
}
