//! Generic row model.
//!
//! Entity rows travel through the generic layer as JSON objects (the store
//! returns `to_jsonb(t)` projections), so `Row` is a thin wrapper over a
//! JSON map with typed access to the columns every table carries: `id`,
//! `gn`, `deleted`, `ctime`, `mtime`, `details`.

use crate::error::{DataError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    fields: Map<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Row { fields: Map::new() }
    }

    /// Wrap a JSON value; anything but an object is a contract violation.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Row { fields }),
            other => Err(DataError::internal(format!(
                "expected row object, got {}",
                kind_of(&other)
            ))),
        }
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Row { fields }
    }

    /// Row identifier; absent on objects submitted for creation.
    pub fn id(&self) -> Option<i64> {
        self.fields.get("id").and_then(Value::as_i64)
    }

    /// Generation counter; starts at 1, +1 per successful update.
    pub fn gn(&self) -> Option<i32> {
        self.fields.get("gn").and_then(Value::as_i64).map(|v| v as i32)
    }

    pub fn deleted(&self) -> bool {
        self.fields
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn ctime(&self) -> Option<DateTime<Utc>> {
        self.timestamp("ctime")
    }

    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        self.timestamp("mtime")
    }

    fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(Value::as_bool)
    }

    /// Integer array column (e.g. `user_ids`); absent or null reads as empty.
    pub fn get_i64_array(&self, key: &str) -> Vec<i64> {
        self.fields
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Overlay `other`'s fields on top of this row, returning the merged
    /// copy. Used to reconstruct "before" images from sparse diffs.
    pub fn overlaid_with(&self, other: &Map<String, Value>) -> Row {
        let mut fields = self.fields.clone();
        for (key, value) in other {
            fields.insert(key.clone(), value.clone());
        }
        Row { fields }
    }
}

impl Default for Row {
    fn default() -> Self {
        Row::new()
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_getters() {
        let row = Row::from_value(json!({
            "id": 17,
            "gn": 3,
            "deleted": false,
            "ctime": "2025-06-01T12:00:00+00:00",
            "user_ids": [7, 9],
            "type": "post"
        }))
        .unwrap();
        assert_eq!(row.id(), Some(17));
        assert_eq!(row.gn(), Some(3));
        assert!(!row.deleted());
        assert_eq!(row.get_i64_array("user_ids"), vec![7, 9]);
        assert_eq!(row.get_str("type"), Some("post"));
        assert!(row.ctime().is_some());
        assert!(row.mtime().is_none());
    }

    #[test]
    fn test_rejects_non_object() {
        assert!(Row::from_value(json!([1, 2])).is_err());
        assert!(Row::from_value(json!("x")).is_err());
    }

    #[test]
    fn test_overlay_reconstructs_before_image() {
        let current = Row::from_value(json!({
            "id": 1, "published": true, "type": "post"
        }))
        .unwrap();
        let previous = json!({"published": false});
        let before = current.overlaid_with(previous.as_object().unwrap());
        assert_eq!(before.get_bool("published"), Some(false));
        assert_eq!(before.get_str("type"), Some("post"));
        // The current image is untouched
        assert_eq!(current.get_bool("published"), Some(true));
    }

    #[test]
    fn test_missing_array_reads_empty() {
        let row = Row::from_value(json!({"id": 1, "user_ids": null})).unwrap();
        assert!(row.get_i64_array("user_ids").is_empty());
        assert!(row.get_i64_array("role_ids").is_empty());
    }
}
