//! Session accessor (global scope).
//!
//! Sessions are issued and revoked by the authentication subsystem, not
//! through generic storage; through the gateway the table is visible to
//! unrestricted identities only, and handles are never exported.

use crate::accessor::Accessor;
use crate::credentials::Credentials;
use crate::descriptor::{ColumnDef, ColumnKind, ExportOptions, Scope};
use crate::registry::AccessorRegistry;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use trellis_commons::{CriteriaSet, CriteriaType, DataError, Result, Row, TableName};

const COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("user_id", ColumnKind::BigInt),
    ColumnDef::new("handle", ColumnKind::Text).unique(),
    ColumnDef::new("area", ColumnKind::Text).not_null("'client'"),
    ColumnDef::new("etime", ColumnKind::Timestamp),
];

pub struct SessionAccessor {
    criteria: CriteriaSet,
}

impl SessionAccessor {
    pub fn new() -> Self {
        SessionAccessor {
            criteria: CriteriaSet::new()
                .with("id", CriteriaType::Int)
                .with("user_id", CriteriaType::Int)
                .with("area", CriteriaType::Text),
        }
    }
}

impl Default for SessionAccessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Accessor for SessionAccessor {
    fn table(&self) -> TableName {
        TableName::literal("session")
    }

    fn scope(&self) -> Scope {
        Scope::Global
    }

    fn columns(&self) -> &[ColumnDef] {
        COLUMNS
    }

    fn criteria(&self) -> &CriteriaSet {
        &self.criteria
    }

    fn restricted(&self) -> bool {
        true
    }

    fn export(
        &self,
        rows: Vec<Row>,
        _credentials: &Credentials,
        options: &ExportOptions,
    ) -> Result<Vec<Value>> {
        Ok(rows
            .into_iter()
            .map(|mut row| {
                // The handle is the bearer credential itself
                row.remove("handle");
                if !options.include_ctime {
                    row.remove("ctime");
                }
                if !options.include_mtime {
                    row.remove("mtime");
                }
                row.into_value()
            })
            .collect())
    }

    async fn import(
        &self,
        _registry: &AccessorRegistry,
        _pool: &PgPool,
        _object: Row,
        _original: Option<&Row>,
        credentials: &Credentials,
    ) -> Result<Row> {
        // Even unrestricted callers go through the auth subsystem
        let _ = credentials;
        Err(DataError::forbidden(
            "sessions cannot be modified through generic storage",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Access;
    use serde_json::json;

    #[test]
    fn test_handle_never_exported() {
        let accessor = SessionAccessor::new();
        let creds = Credentials {
            user_id: 1,
            project_id: None,
            access: Access::Write,
            unrestricted: true,
            area: "admin".to_string(),
        };
        let row = Row::from_value(json!({
            "id": 5, "gn": 1, "user_id": 1,
            "handle": "secret-token", "area": "client",
            "etime": "2026-01-01T00:00:00+00:00"
        }))
        .unwrap();
        let exported = accessor
            .export(vec![row], &creds, &Default::default())
            .unwrap();
        assert!(exported[0].get("handle").is_none());
        assert_eq!(exported[0]["user_id"], 1);
    }

    #[test]
    fn test_table_is_restricted() {
        assert!(SessionAccessor::new().restricted());
    }
}
