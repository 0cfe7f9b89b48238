//! Dialect-neutral parameter values bound into SQL statements.

use serde_json::Value as JsonValue;

/// A bind parameter derived from a record field. Scalar JSON kinds map
/// directly; objects and arrays bind as JSON documents.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Float(f64),
    Bool(bool),
    Json(JsonValue),
    Null,
}

impl SqlValue {
    pub fn from_json(value: &JsonValue) -> SqlValue {
        match value {
            JsonValue::Null => SqlValue::Null,
            JsonValue::Bool(b) => SqlValue::Bool(*b),
            JsonValue::Number(n) => SqlValue::Float(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => SqlValue::Text(s.clone()),
            JsonValue::Array(_) | JsonValue::Object(_) => SqlValue::Json(value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_kinds_map_directly() {
        assert_eq!(SqlValue::from_json(&json!("a")), SqlValue::Text("a".into()));
        assert_eq!(SqlValue::from_json(&json!(1.5)), SqlValue::Float(1.5));
        assert_eq!(SqlValue::from_json(&json!(true)), SqlValue::Bool(true));
        assert_eq!(SqlValue::from_json(&json!(null)), SqlValue::Null);
    }

    #[test]
    fn composites_bind_as_json() {
        assert!(matches!(
            SqlValue::from_json(&json!({"a": 1})),
            SqlValue::Json(_)
        ));
        assert!(matches!(SqlValue::from_json(&json!([1, 2])), SqlValue::Json(_)));
    }
}
