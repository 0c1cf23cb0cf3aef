//! Row change events.
//!
//! Produced by the store's trigger function on every committed mutation.
//! The "previous" map is sparse — it holds only the tracked columns whose
//! values changed — so the "before" image is reconstructed by overlaying
//! it on the current image. Events are ephemeral; duplicates and gaps are
//! possible and consumers must tolerate both.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use trellis_commons::{DataError, Result, Row, SchemaName, TableName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub schema: SchemaName,
    pub table: TableName,
    /// Full row image: NEW for insert/update, OLD for delete.
    pub current: Row,
    /// Changed tracked columns with their prior values (updates only).
    pub previous: Map<String, Value>,
    /// Changed column names; for insert/delete, every column.
    pub diff: BTreeSet<String>,
}

impl ChangeEvent {
    /// Parse a trigger payload (already dequeued if it was oversized).
    pub fn parse(payload: &Value) -> Result<ChangeEvent> {
        let op = match payload.get("op").and_then(Value::as_str) {
            Some("INSERT") => ChangeOp::Insert,
            Some("UPDATE") => ChangeOp::Update,
            Some("DELETE") => ChangeOp::Delete,
            other => {
                return Err(DataError::internal(format!(
                    "unknown change op: {:?}",
                    other
                )))
            }
        };
        let schema = payload
            .get("schema")
            .and_then(Value::as_str)
            .ok_or_else(|| DataError::internal("change event lacks schema"))?;
        let table = payload
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| DataError::internal("change event lacks table"))?;
        let current = Row::from_value(
            payload
                .get("current")
                .cloned()
                .ok_or_else(|| DataError::internal("change event lacks current image"))?,
        )?;
        let previous = payload
            .get("previous")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let diff = match op {
            ChangeOp::Update => previous.keys().cloned().collect(),
            ChangeOp::Insert | ChangeOp::Delete => current.keys().cloned().collect(),
        };
        Ok(ChangeEvent {
            op,
            schema: SchemaName::parse(schema)?,
            table: TableName::parse(table)?,
            current,
            previous,
            diff,
        })
    }

    /// The row as it looked before the change. For inserts this equals the
    /// current image; for deletes the current image is already the old row.
    pub fn before_image(&self) -> Row {
        self.current.overlaid_with(&self.previous)
    }

    pub fn id(&self) -> Option<i64> {
        self.current.id()
    }

    pub fn changed(&self, column: &str) -> bool {
        self.diff.contains(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_update_event() {
        let payload = json!({
            "op": "UPDATE",
            "schema": "acme",
            "table": "story",
            "current": {"id": 17, "gn": 2, "published": true, "type": "post"},
            "previous": {"published": false}
        });
        let event = ChangeEvent::parse(&payload).unwrap();
        assert_eq!(event.op, ChangeOp::Update);
        assert_eq!(event.id(), Some(17));
        assert!(event.changed("published"));
        assert!(!event.changed("type"));
        let before = event.before_image();
        assert_eq!(before.get_bool("published"), Some(false));
        assert_eq!(before.get_str("type"), Some("post"));
    }

    #[test]
    fn test_parse_insert_has_full_diff() {
        let payload = json!({
            "op": "INSERT",
            "schema": "acme",
            "table": "story",
            "current": {"id": 18, "gn": 1, "published": false},
            "previous": {}
        });
        let event = ChangeEvent::parse(&payload).unwrap();
        assert_eq!(event.op, ChangeOp::Insert);
        assert!(event.changed("published"));
        assert!(event.changed("id"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ChangeEvent::parse(&json!({"op": "TRUNCATE"})).is_err());
        assert!(ChangeEvent::parse(&json!({"op": "INSERT"})).is_err());
    }
}
