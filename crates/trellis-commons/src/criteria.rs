//! Typed query criteria.
//!
//! Each accessor declares the filter keys it accepts and their semantic
//! types; the gateway validates caller-supplied criteria against that
//! declaration at the boundary. Unknown keys are a contract violation and
//! are rejected, never silently ignored.

use crate::error::{DataError, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Semantic type of a criteria key, which also determines how the SQL
/// builder matches it against its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriteriaType {
    /// Scalar bigint column; a list value matches via `= ANY(...)`.
    Int,
    /// Scalar text column; a list value matches via `= ANY(...)`.
    Text,
    /// Boolean column.
    Bool,
    /// Timestamp column, matched by exact value.
    Timestamp,
    /// Timestamp column, matched by inclusive lower bound.
    TimeNewerThan,
    /// `bigint[]` column, matched by overlap (`&&`).
    IntArray,
    /// `text[]` column, matched by overlap (`&&`).
    TextArray,
}

/// A validated criteria value.
#[derive(Debug, Clone, PartialEq)]
pub enum CriteriaValue {
    Int(i64),
    IntList(Vec<i64>),
    Text(String),
    TextList(Vec<String>),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

/// Declaration of the criteria keys one accessor accepts.
#[derive(Debug, Clone, Default)]
pub struct CriteriaSet {
    keys: BTreeMap<String, CriteriaType>,
}

impl CriteriaSet {
    pub fn new() -> Self {
        CriteriaSet {
            keys: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, kind: CriteriaType) -> Self {
        self.keys.insert(key.to_string(), kind);
        self
    }

    pub fn kind_of(&self, key: &str) -> Option<CriteriaType> {
        self.keys.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = (&String, CriteriaType)> {
        self.keys.iter().map(|(k, t)| (k, *t))
    }

    /// Validate a caller-supplied criteria object. Returns the typed
    /// criteria; any unknown key or ill-typed value aborts with 400.
    pub fn validate(&self, raw: &Map<String, Value>) -> Result<Criteria> {
        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let kind = self.kind_of(key).ok_or_else(|| {
                DataError::bad_request(format!("unknown criteria key: {}", key))
            })?;
            let typed = coerce(key, kind, value)?;
            entries.push((key.clone(), kind, typed));
        }
        Ok(Criteria { entries })
    }
}

/// Criteria validated against one accessor's declaration.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    entries: Vec<(String, CriteriaType, CriteriaValue)>,
}

impl Criteria {
    pub fn new() -> Self {
        Criteria {
            entries: Vec::new(),
        }
    }

    /// Internal construction path for criteria the system builds itself
    /// (already known to match the accessor's declaration).
    pub fn push(&mut self, key: &str, kind: CriteriaType, value: CriteriaValue) {
        self.entries.push((key.to_string(), kind, value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, CriteriaType, &CriteriaValue)> {
        self.entries.iter().map(|(k, t, v)| (k.as_str(), *t, v))
    }
}

fn coerce(key: &str, kind: CriteriaType, value: &Value) -> Result<CriteriaValue> {
    let mismatch = || {
        DataError::bad_request(format!(
            "invalid value for criteria key {}: {}",
            key, value
        ))
    };
    match kind {
        CriteriaType::Int | CriteriaType::IntArray => match value {
            Value::Number(n) => n.as_i64().map(CriteriaValue::Int).ok_or_else(mismatch),
            Value::Array(items) => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    list.push(item.as_i64().ok_or_else(mismatch)?);
                }
                Ok(CriteriaValue::IntList(list))
            }
            // Comma-separated strings arrive from query parameters
            Value::String(s) => parse_int_list(s).ok_or_else(mismatch),
            _ => Err(mismatch()),
        },
        CriteriaType::Text | CriteriaType::TextArray => match value {
            Value::String(s) => Ok(CriteriaValue::Text(s.clone())),
            Value::Array(items) => {
                let mut list = Vec::with_capacity(items.len());
                for item in items {
                    list.push(item.as_str().ok_or_else(mismatch)?.to_string());
                }
                Ok(CriteriaValue::TextList(list))
            }
            _ => Err(mismatch()),
        },
        CriteriaType::Bool => match value {
            Value::Bool(b) => Ok(CriteriaValue::Bool(*b)),
            Value::String(s) if s == "true" || s == "false" => {
                Ok(CriteriaValue::Bool(s == "true"))
            }
            _ => Err(mismatch()),
        },
        CriteriaType::Timestamp | CriteriaType::TimeNewerThan => match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|t| CriteriaValue::Timestamp(t.with_timezone(&Utc)))
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
    }
}

fn parse_int_list(s: &str) -> Option<CriteriaValue> {
    if let Ok(single) = s.parse::<i64>() {
        return Some(CriteriaValue::Int(single));
    }
    let mut list = Vec::new();
    for part in s.split(',') {
        list.push(part.trim().parse::<i64>().ok()?);
    }
    Some(CriteriaValue::IntList(list))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn story_criteria() -> CriteriaSet {
        CriteriaSet::new()
            .with("id", CriteriaType::Int)
            .with("type", CriteriaType::Text)
            .with("published", CriteriaType::Bool)
            .with("user_ids", CriteriaType::IntArray)
            .with("newer_than", CriteriaType::TimeNewerThan)
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_accepts_declared_keys() {
        let set = story_criteria();
        let criteria = set
            .validate(&obj(json!({
                "type": "post",
                "published": true,
                "user_ids": [7, 9],
                "id": [1, 2, 3]
            })))
            .unwrap();
        assert_eq!(criteria.len(), 4);
    }

    #[test]
    fn test_rejects_unknown_key() {
        let set = story_criteria();
        let err = set
            .validate(&obj(json!({"nonsense": 1})))
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("nonsense"));
    }

    #[test]
    fn test_rejects_ill_typed_value() {
        let set = story_criteria();
        assert!(set.validate(&obj(json!({"published": "maybe"}))).is_err());
        assert!(set.validate(&obj(json!({"id": "seven!"}))).is_err());
        assert!(set.validate(&obj(json!({"newer_than": "yesterday"}))).is_err());
    }

    #[test]
    fn test_query_string_coercions() {
        let set = story_criteria();
        let criteria = set
            .validate(&obj(json!({"id": "1,2,3", "published": "true"})))
            .unwrap();
        let ids = criteria
            .entries()
            .find(|(k, _, _)| *k == "id")
            .map(|(_, _, v)| v.clone())
            .unwrap();
        assert_eq!(ids, CriteriaValue::IntList(vec![1, 2, 3]));
    }
}
