//! Role accessor (global scope).
//!
//! Roles own their member lists; each user's `role_ids` is derived from
//! them. Saving a role re-derives the references for every affected user.

use crate::accessor::{import_base, Accessor};
use crate::credentials::Credentials;
use crate::descriptor::{ColumnDef, ColumnKind, Scope};
use crate::registry::AccessorRegistry;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use trellis_commons::{CriteriaSet, CriteriaType, DataError, Result, Row, SchemaName, TableName};

const COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("name", ColumnKind::Text).unique(),
    ColumnDef::new("user_ids", ColumnKind::BigIntArray).not_null("'{}'"),
    ColumnDef::new("disabled", ColumnKind::Bool).not_null("false"),
];

pub struct RoleAccessor {
    criteria: CriteriaSet,
}

impl RoleAccessor {
    pub fn new() -> Self {
        RoleAccessor {
            criteria: CriteriaSet::new()
                .with("id", CriteriaType::Int)
                .with("name", CriteriaType::Text)
                .with("disabled", CriteriaType::Bool)
                .with("user_ids", CriteriaType::IntArray),
        }
    }
}

impl Default for RoleAccessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Accessor for RoleAccessor {
    fn table(&self) -> TableName {
        TableName::literal("role")
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

    async fn import(
        &self,
        _registry: &AccessorRegistry,
        _pool: &PgPool,
        object: Row,
        original: Option<&Row>,
        credentials: &Credentials,
    ) -> Result<Row> {
        let object = import_base(object, original, credentials)?;
        if !credentials.unrestricted {
            return Err(DataError::forbidden(
                "modifying roles requires administrative access",
            ));
        }
        Ok(object)
    }

    /// Re-derive `role_ids` for every user whose membership in this role
    /// changed — removed members included, hence the union of both lists.
    async fn associate(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        _schema: &SchemaName,
        _registry: &AccessorRegistry,
        _objects: &[Row],
        originals: &[Option<Row>],
        saved: &[Row],
        _credentials: &Credentials,
    ) -> Result<()> {
        let mut affected: Vec<i64> = Vec::new();
        for (saved_row, original) in saved.iter().zip(originals.iter()) {
            let before = original
                .as_ref()
                .map(|o| o.get_i64_array("user_ids"))
                .unwrap_or_default();
            let after = saved_row.get_i64_array("user_ids");
            let changed = before != after
                || original.as_ref().map(|o| o.deleted()) != Some(saved_row.deleted())
                || original.as_ref().and_then(|o| o.get_bool("disabled"))
                    != saved_row.get_bool("disabled");
            if changed {
                affected.extend(before);
                affected.extend(after);
            }
        }
        affected.sort_unstable();
        affected.dedup();
        if affected.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE "global"."user" AS u
            SET role_ids = COALESCE(
                    (SELECT array_agg(r.id ORDER BY r.id)
                     FROM "global"."role" r
                     WHERE r.deleted = false AND r.disabled = false
                       AND r.user_ids @> ARRAY[u.id]),
                    '{}'),
                gn = gn + 1,
                mtime = NOW()
            WHERE u.id = ANY($1)
            "#,
        )
        .bind(&affected)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Access;
    use serde_json::json;

    #[tokio::test]
    async fn test_import_requires_admin() {
        let accessor = RoleAccessor::new();
        let registry = AccessorRegistry::standard();
        let pool = PgPool::connect_lazy("postgres://unused@localhost/unused").unwrap();
        let creds = Credentials {
            user_id: 7,
            project_id: None,
            access: Access::Write,
            unrestricted: false,
            area: "client".to_string(),
        };
        let object = Row::from_value(json!({"name": "devs"})).unwrap();
        let err = accessor
            .import(&registry, &pool, object, None, &creds)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }
}
