//! Project accessor (global scope).
//!
//! A project row owns one tenant namespace: naming the project creates the
//! schema, renaming it renames the schema, and soft-deleting it retires
//! the schema — all driven by the structural event channel, not by
//! imperative calls from here.

use crate::accessor::{import_base, Accessor};
use crate::credentials::Credentials;
use crate::descriptor::{ColumnDef, ColumnKind, Scope};
use crate::registry::AccessorRegistry;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use trellis_commons::{
    CriteriaSet, CriteriaType, DataError, Result, Row, SchemaName, TableName,
};
use trellis_store::notify;

const COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("name", ColumnKind::Text).unique(),
    ColumnDef::new("user_ids", ColumnKind::BigIntArray).not_null("'{}'"),
    ColumnDef::new("settings", ColumnKind::Jsonb).not_null("'{}'"),
    ColumnDef::new("archived", ColumnKind::Bool).not_null("false"),
];

/// Columns whose transitions the structural channel must see.
const STRUCTURAL_COLUMNS: &[&str] = &["name", "deleted"];

pub struct ProjectAccessor {
    criteria: CriteriaSet,
}

impl ProjectAccessor {
    pub fn new() -> Self {
        ProjectAccessor {
            criteria: CriteriaSet::new()
                .with("id", CriteriaType::Int)
                .with("name", CriteriaType::Text)
                .with("archived", CriteriaType::Bool)
                .with("user_ids", CriteriaType::IntArray),
        }
    }
}

impl Default for ProjectAccessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the project is hidden from the directory listing.
pub fn is_unlisted(project: &Row) -> bool {
    setting_flag(project, "unlisted")
}

/// Whether non-members get read access to the project's content.
pub fn grants_view_to_non_members(project: &Row) -> bool {
    setting_flag(project, "grant_view_access_to_non_members")
}

fn setting_flag(project: &Row, flag: &str) -> bool {
    project
        .get("settings")
        .and_then(|s| s.get("access_control"))
        .and_then(|ac| ac.get(flag))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[async_trait]
impl Accessor for ProjectAccessor {
    fn table(&self) -> TableName {
        TableName::literal("project")
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

    fn filter_columns(&self) -> &'static [&'static str] {
        &["name", "user_ids", "settings"]
    }

    /// Attach the regular change trigger plus a second trigger feeding the
    /// structural channel the lifecycle manager listens on.
    async fn watch(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        schema: &SchemaName,
        tracked: &[&str],
    ) -> Result<()> {
        let table = self.table();
        let drop = format!(
            "DROP TRIGGER IF EXISTS \"project_notify\" ON {}.{}",
            schema.quoted(),
            table.quoted()
        );
        sqlx::query(&drop).execute(&mut **tx).await?;
        let create = notify::watch_trigger_sql(
            "project_notify",
            &schema.quoted(),
            &table,
            &notify::change_channel(&table),
            tracked,
        );
        sqlx::query(&create).execute(&mut **tx).await?;

        let drop = format!(
            "DROP TRIGGER IF EXISTS \"project_schema_event\" ON {}.{}",
            schema.quoted(),
            table.quoted()
        );
        sqlx::query(&drop).execute(&mut **tx).await?;
        let create = notify::watch_trigger_sql(
            "project_schema_event",
            &schema.quoted(),
            &table,
            notify::SCHEMA_EVENT_CHANNEL,
            STRUCTURAL_COLUMNS,
        );
        sqlx::query(&create).execute(&mut **tx).await?;
        Ok(())
    }

    /// Non-members only know projects listed in the directory.
    fn filter(&self, rows: Vec<Row>, credentials: &Credentials) -> Vec<Row> {
        if credentials.unrestricted {
            return rows;
        }
        rows.into_iter()
            .filter(|row| {
                row.get_i64_array("user_ids").contains(&credentials.user_id)
                    || !is_unlisted(row)
            })
            .collect()
    }

    /// Settings are visible to members and unrestricted identities only.
    fn export(
        &self,
        rows: Vec<Row>,
        credentials: &Credentials,
        options: &crate::descriptor::ExportOptions,
    ) -> Result<Vec<Value>> {
        Ok(rows
            .into_iter()
            .map(|mut row| {
                let member = row.get_i64_array("user_ids").contains(&credentials.user_id);
                if !credentials.unrestricted && !member {
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
                        "creating a project requires administrative access",
                    ));
                }
            }
            Some(original) => {
                if !credentials.unrestricted {
                    for field in ["name", "user_ids", "settings"] {
                        if let Some(value) = object.get(field) {
                            if Some(value) != original.get(field) {
                                return Err(DataError::forbidden(format!(
                                    "changing project {} requires administrative access",
                                    field
                                )));
                            }
                        }
                    }
                    if object.get_bool("deleted") == Some(true) && !original.deleted() {
                        return Err(DataError::forbidden(
                            "deleting a project requires administrative access",
                        ));
                    }
                }
            }
        }
        // The name becomes a schema name; validate it up front so the
        // lifecycle manager never sees an unusable one.
        if let Some(name) = object.get_str("name") {
            SchemaName::parse(name)?;
        }
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Access;
    use serde_json::json;

    fn member_creds() -> Credentials {
        Credentials {
            user_id: 7,
            project_id: None,
            access: Access::Read,
            unrestricted: false,
            area: "client".to_string(),
        }
    }

    fn admin_creds() -> Credentials {
        Credentials {
            user_id: 1,
            project_id: None,
            access: Access::Write,
            unrestricted: true,
            area: "admin".to_string(),
        }
    }

    fn project(id: i64, user_ids: Vec<i64>, settings: Value) -> Row {
        Row::from_value(json!({
            "id": id, "gn": 1, "deleted": false,
            "name": "acme", "user_ids": user_ids,
            "settings": settings, "archived": false
        }))
        .unwrap()
    }

    #[test]
    fn test_filter_hides_unlisted_from_non_members() {
        let accessor = ProjectAccessor::new();
        let rows = vec![
            project(1, vec![9], json!({"access_control": {"unlisted": true}})),
            project(2, vec![9], json!({})),
            project(3, vec![7], json!({"access_control": {"unlisted": true}})),
        ];
        let visible = accessor.filter(rows, &member_creds());
        let ids: Vec<i64> = visible.iter().filter_map(Row::id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_export_strips_settings_for_non_members() {
        let accessor = ProjectAccessor::new();
        let rows = vec![project(1, vec![9], json!({"secret": true}))];
        let exported = accessor
            .export(rows, &member_creds(), &Default::default())
            .unwrap();
        assert!(exported[0].get("settings").is_none());

        let rows = vec![project(1, vec![7], json!({"secret": true}))];
        let exported = accessor
            .export(rows, &member_creds(), &Default::default())
            .unwrap();
        assert!(exported[0].get("settings").is_some());
    }

    #[tokio::test]
    async fn test_import_rejects_non_admin_create() {
        let accessor = ProjectAccessor::new();
        let registry = AccessorRegistry::standard();
        let pool = sqlx::PgPool::connect_lazy("postgres://unused@localhost/unused").unwrap();
        let object = Row::from_value(json!({"name": "acme"})).unwrap();
        let err = accessor
            .import(&registry, &pool, object, None, &member_creds())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_import_rejects_invalid_schema_name() {
        let accessor = ProjectAccessor::new();
        let registry = AccessorRegistry::standard();
        let pool = sqlx::PgPool::connect_lazy("postgres://unused@localhost/unused").unwrap();
        let object = Row::from_value(json!({"name": "Bad Name!"})).unwrap();
        let err = accessor
            .import(&registry, &pool, object, None, &admin_creds())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
