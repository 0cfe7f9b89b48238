use serde_json::{Map, Value};

/// A source-store document: a flat JSON object keyed by attribute name.
pub type Record = Map<String, Value>;

/// Extracts the primary key of a record, if present.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get("id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Builds a record from a JSON value, rejecting anything but an object.
pub fn as_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_string_and_numeric_ids() {
        let rec = as_record(json!({"id": "u1", "name": "A"})).unwrap();
        assert_eq!(record_id(&rec).as_deref(), Some("u1"));

        let rec = as_record(json!({"id": 42})).unwrap();
        assert_eq!(record_id(&rec).as_deref(), Some("42"));

        let rec = as_record(json!({"name": "no id"})).unwrap();
        assert_eq!(record_id(&rec), None);
    }

    #[test]
    fn rejects_non_objects() {
        assert!(as_record(json!([1, 2, 3])).is_none());
        assert!(as_record(json!("scalar")).is_none());
    }
}
