//! User accessor (global scope).
//!
//! Carries the privileged-field rules (type, disabled, approved, role_ids
//! are administrative) and the membership side effect: approving a user
//! adds them to the projects they requested.

use crate::accessor::{import_base, Accessor};
use crate::credentials::Credentials;
use crate::descriptor::{ColumnDef, ColumnKind, ExportOptions, Scope};
use crate::registry::AccessorRegistry;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use trellis_commons::{CriteriaSet, CriteriaType, DataError, Result, Row, SchemaName, TableName};

const COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("username", ColumnKind::Text).unique(),
    ColumnDef::new("type", ColumnKind::Text).not_null("'regular'"),
    ColumnDef::new("disabled", ColumnKind::Bool).not_null("false"),
    ColumnDef::new("approved", ColumnKind::Bool).not_null("false"),
    ColumnDef::new("requested_project_ids", ColumnKind::BigIntArray).not_null("'{}'"),
    ColumnDef::new("role_ids", ColumnKind::BigIntArray).not_null("'{}'"),
    ColumnDef::new("settings", ColumnKind::Jsonb).not_null("'{}'"),
];

/// Fields only unrestricted identities may set.
const PRIVILEGED_FIELDS: &[&str] = &["type", "disabled", "approved", "role_ids", "username"];

pub struct UserAccessor {
    criteria: CriteriaSet,
}

impl UserAccessor {
    pub fn new() -> Self {
        UserAccessor {
            criteria: CriteriaSet::new()
                .with("id", CriteriaType::Int)
                .with("username", CriteriaType::Text)
                .with("type", CriteriaType::Text)
                .with("disabled", CriteriaType::Bool)
                .with("approved", CriteriaType::Bool)
                .with("role_ids", CriteriaType::IntArray),
        }
    }
}

impl Default for UserAccessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Accessor for UserAccessor {
    fn table(&self) -> TableName {
        TableName::literal("user")
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

    /// Settings are visible only to their owner (or unrestricted callers).
    fn export(
        &self,
        rows: Vec<Row>,
        credentials: &Credentials,
        options: &ExportOptions,
    ) -> Result<Vec<Value>> {
        Ok(rows
            .into_iter()
            .map(|mut row| {
                if !credentials.unrestricted && row.id() != Some(credentials.user_id) {
                    row.remove("settings");
                }
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
        object: Row,
        original: Option<&Row>,
        credentials: &Credentials,
    ) -> Result<Row> {
        let object = import_base(object, original, credentials)?;
        match original {
            None => {
                if !credentials.unrestricted {
                    return Err(DataError::forbidden(
                        "creating a user requires administrative access",
                    ));
                }
            }
            Some(original) => {
                if !credentials.unrestricted {
                    if original.id() != Some(credentials.user_id) {
                        return Err(DataError::forbidden(
                            "users can only modify their own account",
                        ));
                    }
                    for field in PRIVILEGED_FIELDS {
                        if let Some(value) = object.get(field) {
                            if Some(value) != original.get(field) {
                                return Err(DataError::forbidden(format!(
                                    "setting {} requires administrative access",
                                    field
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(object)
    }

    /// Approval side effect: a user whose `approved` flag flipped true is
    /// added to every project they requested, in the same transaction.
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
        for (saved_row, original) in saved.iter().zip(originals.iter()) {
            let was_approved = original
                .as_ref()
                .and_then(|o| o.get_bool("approved"))
                .unwrap_or(false);
            let is_approved = saved_row.get_bool("approved").unwrap_or(false);
            if !is_approved || was_approved {
                continue;
            }
            let user_id = match saved_row.id() {
                Some(id) => id,
                None => continue,
            };
            let requested = saved_row.get_i64_array("requested_project_ids");
            if requested.is_empty() {
                continue;
            }
            sqlx::query(
                r#"
                UPDATE "global"."project"
                SET user_ids = array_append(user_ids, $1), gn = gn + 1, mtime = NOW()
                WHERE id = ANY($2) AND deleted = false AND NOT user_ids @> ARRAY[$1]::bigint[]
                "#,
            )
            .bind(user_id)
            .bind(&requested)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}
