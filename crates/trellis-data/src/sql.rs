//! SQL generation for the generic accessor layer.
//!
//! Identifiers are never taken from callers: schema and table names pass
//! through the validated newtypes and column names come from the static
//! descriptors. Values always travel as binds.

use crate::descriptor::{ColumnDef, ColumnKind, ColumnSelection, FindOptions};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;
use trellis_commons::{
    Criteria, CriteriaType, CriteriaValue, DataError, Result, SchemaName, TableName,
};

/// Owned bind value, applied to a query in declaration order.
#[derive(Debug, Clone)]
pub enum BindValue {
    I64(Option<i64>),
    I32(Option<i32>),
    Text(Option<String>),
    Bool(Option<bool>),
    Time(Option<DateTime<Utc>>),
    I64List(Option<Vec<i64>>),
    TextList(Option<Vec<String>>),
    Json(Option<Value>),
}

pub fn apply_bind<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: BindValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        BindValue::I64(v) => query.bind(v),
        BindValue::I32(v) => query.bind(v),
        BindValue::Text(v) => query.bind(v),
        BindValue::Bool(v) => query.bind(v),
        BindValue::Time(v) => query.bind(v),
        BindValue::I64List(v) => query.bind(v),
        BindValue::TextList(v) => query.bind(v),
        BindValue::Json(v) => query.bind(v),
    }
}

/// A generated statement plus its binds.
#[derive(Debug)]
pub struct Statement {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

impl Statement {
    pub fn query(&self) -> Query<'_, Postgres, PgArguments> {
        let mut query = sqlx::query(&self.sql);
        for bind in &self.binds {
            query = apply_bind(query, bind.clone());
        }
        query
    }
}

/// Base columns every entity table carries.
const BASE_COLUMNS: &[&str] = &["id", "gn", "deleted", "ctime", "mtime", "details"];

/// CREATE TABLE DDL for one entity table.
pub fn create_table(schema: &SchemaName, table: &TableName, columns: &[ColumnDef]) -> String {
    let mut defs = vec![
        "\"id\" BIGSERIAL PRIMARY KEY".to_string(),
        "\"gn\" INT NOT NULL DEFAULT 1".to_string(),
        "\"deleted\" BOOLEAN NOT NULL DEFAULT false".to_string(),
        "\"ctime\" TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string(),
        "\"mtime\" TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string(),
        "\"details\" JSONB NOT NULL DEFAULT '{}'".to_string(),
    ];
    defs.extend(columns.iter().map(|c| c.ddl()));
    format!(
        "CREATE TABLE {}.{} (\n    {}\n)",
        schema.quoted(),
        table.quoted(),
        defs.join(",\n    ")
    )
}

/// SELECT over one entity table from validated criteria.
pub fn select(
    schema: &SchemaName,
    table: &TableName,
    criteria: &Criteria,
    options: &FindOptions,
) -> Result<Statement> {
    let projection = match &options.columns {
        ColumnSelection::All => "to_jsonb(t)".to_string(),
        ColumnSelection::IdGnPlus(extra) => {
            let mut pairs = vec![
                "'id', t.\"id\"".to_string(),
                "'gn', t.\"gn\"".to_string(),
            ];
            for col in extra {
                pairs.push(format!("'{0}', t.\"{0}\"", col));
            }
            format!("jsonb_build_object({})", pairs.join(", "))
        }
    };

    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<BindValue> = Vec::new();
    if !options.include_deleted {
        clauses.push("t.\"deleted\" = false".to_string());
    }
    for (key, kind, value) in criteria.entries() {
        let n = binds.len() + 1;
        match (kind, value) {
            (CriteriaType::Int, CriteriaValue::Int(v)) => {
                clauses.push(format!("t.\"{}\" = ${}", key, n));
                binds.push(BindValue::I64(Some(*v)));
            }
            (CriteriaType::Int, CriteriaValue::IntList(v)) => {
                clauses.push(format!("t.\"{}\" = ANY(${})", key, n));
                binds.push(BindValue::I64List(Some(v.clone())));
            }
            (CriteriaType::Text, CriteriaValue::Text(v)) => {
                clauses.push(format!("t.\"{}\" = ${}", key, n));
                binds.push(BindValue::Text(Some(v.clone())));
            }
            (CriteriaType::Text, CriteriaValue::TextList(v)) => {
                clauses.push(format!("t.\"{}\" = ANY(${})", key, n));
                binds.push(BindValue::TextList(Some(v.clone())));
            }
            (CriteriaType::Bool, CriteriaValue::Bool(v)) => {
                clauses.push(format!("t.\"{}\" = ${}", key, n));
                binds.push(BindValue::Bool(Some(*v)));
            }
            (CriteriaType::Timestamp, CriteriaValue::Timestamp(v)) => {
                clauses.push(format!("t.\"{}\" = ${}", key, n));
                binds.push(BindValue::Time(Some(*v)));
            }
            (CriteriaType::TimeNewerThan, CriteriaValue::Timestamp(v)) => {
                clauses.push(format!("t.\"{}\" >= ${}", key, n));
                binds.push(BindValue::Time(Some(*v)));
            }
            (CriteriaType::IntArray, CriteriaValue::Int(v)) => {
                clauses.push(format!("t.\"{}\" && ${}", key, n));
                binds.push(BindValue::I64List(Some(vec![*v])));
            }
            (CriteriaType::IntArray, CriteriaValue::IntList(v)) => {
                clauses.push(format!("t.\"{}\" && ${}", key, n));
                binds.push(BindValue::I64List(Some(v.clone())));
            }
            (CriteriaType::TextArray, CriteriaValue::Text(v)) => {
                clauses.push(format!("t.\"{}\" && ${}", key, n));
                binds.push(BindValue::TextList(Some(vec![v.clone()])));
            }
            (CriteriaType::TextArray, CriteriaValue::TextList(v)) => {
                clauses.push(format!("t.\"{}\" && ${}", key, n));
                binds.push(BindValue::TextList(Some(v.clone())));
            }
            (kind, value) => {
                return Err(DataError::internal(format!(
                    "criteria key {} has mismatched kind {:?} / value {:?}",
                    key, kind, value
                )))
            }
        }
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let order = options.order.as_deref().unwrap_or("id DESC");
    let sql = format!(
        "SELECT {} AS row FROM {}.{} t{} ORDER BY {} LIMIT {}",
        projection,
        schema.quoted(),
        table.quoted(),
        where_clause,
        order,
        options.limit
    );
    Ok(Statement { sql, binds })
}

/// Convert a submitted JSON field into a bind for its declared column.
pub fn bind_for_column(kind: ColumnKind, name: &str, value: &Value) -> Result<BindValue> {
    let mismatch = || {
        DataError::bad_request(format!("invalid value for column {}: {}", name, value))
    };
    if value.is_null() {
        return Ok(match kind {
            ColumnKind::BigInt => BindValue::I64(None),
            ColumnKind::Int => BindValue::I32(None),
            ColumnKind::Text => BindValue::Text(None),
            ColumnKind::Bool => BindValue::Bool(None),
            ColumnKind::Timestamp => BindValue::Time(None),
            ColumnKind::BigIntArray => BindValue::I64List(None),
            ColumnKind::TextArray => BindValue::TextList(None),
            ColumnKind::Jsonb => BindValue::Json(None),
        });
    }
    match kind {
        ColumnKind::BigInt => value
            .as_i64()
            .map(|v| BindValue::I64(Some(v)))
            .ok_or_else(mismatch),
        ColumnKind::Int => value
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(|v| BindValue::I32(Some(v)))
            .ok_or_else(mismatch),
        ColumnKind::Text => value
            .as_str()
            .map(|v| BindValue::Text(Some(v.to_string())))
            .ok_or_else(mismatch),
        ColumnKind::Bool => value
            .as_bool()
            .map(|v| BindValue::Bool(Some(v)))
            .ok_or_else(mismatch),
        ColumnKind::Timestamp => value
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| BindValue::Time(Some(t.with_timezone(&Utc))))
            .ok_or_else(mismatch),
        ColumnKind::BigIntArray => {
            let items = value.as_array().ok_or_else(mismatch)?;
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(item.as_i64().ok_or_else(mismatch)?);
            }
            Ok(BindValue::I64List(Some(list)))
        }
        ColumnKind::TextArray => {
            let items = value.as_array().ok_or_else(mismatch)?;
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(item.as_str().ok_or_else(mismatch)?.to_string());
            }
            Ok(BindValue::TextList(Some(list)))
        }
        ColumnKind::Jsonb => Ok(BindValue::Json(Some(value.clone()))),
    }
}

/// Writable columns in one submitted object, in declaration order:
/// `deleted` and `details` from the base set, then entity columns.
fn writable_columns<'a>(
    object: &'a trellis_commons::Row,
    columns: &'a [ColumnDef],
) -> Result<Vec<(&'a str, ColumnKind, &'a Value)>> {
    let mut out = Vec::new();
    if let Some(value) = object.get("deleted") {
        out.push(("deleted", ColumnKind::Bool, value));
    }
    if let Some(value) = object.get("details") {
        out.push(("details", ColumnKind::Jsonb, value));
    }
    for col in columns {
        if let Some(value) = object.get(col.name) {
            out.push((col.name, col.kind, value));
        }
    }
    // Anything left over that is neither writable nor a managed base
    // column is a shape violation.
    for key in object.keys() {
        let declared = BASE_COLUMNS.contains(&key.as_str())
            || columns.iter().any(|c| c.name == key.as_str());
        if !declared {
            return Err(DataError::bad_request(format!("unknown column: {}", key)));
        }
    }
    Ok(out)
}

/// INSERT for a new row; gn/ctime/mtime come from column defaults.
pub fn insert(
    schema: &SchemaName,
    table: &TableName,
    object: &trellis_commons::Row,
    columns: &[ColumnDef],
) -> Result<Statement> {
    let writable = writable_columns(object, columns)?;
    let mut names = Vec::with_capacity(writable.len());
    let mut placeholders = Vec::with_capacity(writable.len());
    let mut binds = Vec::with_capacity(writable.len());
    for (i, (name, kind, value)) in writable.iter().enumerate() {
        names.push(format!("\"{}\"", name));
        placeholders.push(format!("${}", i + 1));
        binds.push(bind_for_column(*kind, name, value)?);
    }
    let sql = if names.is_empty() {
        format!(
            "INSERT INTO {}.{} DEFAULT VALUES RETURNING to_jsonb({}) AS row",
            schema.quoted(),
            table.quoted(),
            table.quoted()
        )
    } else {
        format!(
            "INSERT INTO {}.{} ({}) VALUES ({}) RETURNING to_jsonb({}) AS row",
            schema.quoted(),
            table.quoted(),
            names.join(", "),
            placeholders.join(", "),
            table.quoted()
        )
    };
    Ok(Statement { sql, binds })
}

/// UPDATE guarded by the expected generation number. Matching zero rows
/// means the caller lost an optimistic-concurrency race.
pub fn update(
    schema: &SchemaName,
    table: &TableName,
    object: &trellis_commons::Row,
    columns: &[ColumnDef],
    id: i64,
    gn: i32,
) -> Result<Statement> {
    let writable = writable_columns(object, columns)?;
    let mut sets = vec![
        "\"gn\" = t.\"gn\" + 1".to_string(),
        "\"mtime\" = NOW()".to_string(),
    ];
    let mut binds = Vec::with_capacity(writable.len() + 2);
    for (name, kind, value) in &writable {
        binds.push(bind_for_column(*kind, name, value)?);
        sets.push(format!("\"{}\" = ${}", name, binds.len()));
    }
    binds.push(BindValue::I64(Some(id)));
    let id_slot = binds.len();
    binds.push(BindValue::I32(Some(gn)));
    let gn_slot = binds.len();
    let sql = format!(
        "UPDATE {}.{} AS t SET {} WHERE t.\"id\" = ${} AND t.\"gn\" = ${} RETURNING to_jsonb(t) AS row",
        schema.quoted(),
        table.quoted(),
        sets.join(", "),
        id_slot,
        gn_slot
    );
    Ok(Statement { sql, binds })
}
