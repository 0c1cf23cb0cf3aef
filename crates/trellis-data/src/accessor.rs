//! The entity accessor contract.
//!
//! One implementation per table. Shared behavior — criteria-driven SELECT,
//! generation-checked save, soft-delete garbage collection, trigger
//! attachment — lives in default method bodies; entities override the
//! hooks they specialize (`filter`, `export`, `import`, `associate`,
//! `upgrade`). The override set is static: accessors are registered once
//! at startup and never change.
//!
//! Write-request state machine (driven by the gateway):
//! Validating → Importing → Saving (tx open) → Associating → Committed,
//! with any error after the transaction opens rolling back first.

use crate::credentials::Credentials;
use crate::descriptor::{ColumnDef, ExportOptions, FindOptions, Scope};
use crate::registry::AccessorRegistry;
use crate::sql;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row as SqlxRow, Transaction};
use trellis_commons::{Criteria, CriteriaSet, DataError, Result, Row, SchemaName, TableName};
use trellis_store::notify;

#[async_trait]
pub trait Accessor: Send + Sync {
    // ---- declarative metadata -------------------------------------------

    fn table(&self) -> TableName;

    fn scope(&self) -> Scope;

    /// Version gating schema upgrades; bump when `upgrade` learns a new jump.
    fn version(&self) -> i32 {
        1
    }

    /// Entity-specific columns beyond the base set.
    fn columns(&self) -> &[ColumnDef];

    /// Criteria keys `find` accepts.
    fn criteria(&self) -> &CriteriaSet;

    /// Columns `filter` needs beyond id/gn when discovery runs.
    fn filter_columns(&self) -> &'static [&'static str] {
        &[]
    }

    /// Restricted tables are visible to unrestricted identities only.
    fn restricted(&self) -> bool {
        false
    }

    // ---- DDL hooks (driven by the schema lifecycle manager) -------------

    async fn create(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        schema: &SchemaName,
    ) -> Result<()> {
        let ddl = sql::create_table(schema, &self.table(), self.columns());
        sqlx::query(&ddl).execute(&mut **tx).await?;
        Ok(())
    }

    async fn grant_privileges(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        schema: &SchemaName,
        roles: &[String],
    ) -> Result<()> {
        for role in roles {
            let grant = format!(
                "GRANT SELECT, INSERT, UPDATE, DELETE ON {}.{} TO \"{}\"",
                schema.quoted(),
                self.table().quoted(),
                role
            );
            sqlx::query(&grant).execute(&mut **tx).await?;
        }
        Ok(())
    }

    /// Attach the change trigger. `tracked` is computed by the lifecycle
    /// manager from this accessor's filter columns and the invalidation
    /// registry, so the trigger's previous-value set always covers what
    /// the analysers declare.
    async fn watch(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        schema: &SchemaName,
        tracked: &[&str],
    ) -> Result<()> {
        let table = self.table();
        let trigger = format!("{}_notify", table.as_str());
        let drop = format!(
            "DROP TRIGGER IF EXISTS \"{}\" ON {}.{}",
            trigger,
            schema.quoted(),
            table.quoted()
        );
        sqlx::query(&drop).execute(&mut **tx).await?;
        let create = notify::watch_trigger_sql(
            &trigger,
            &schema.quoted(),
            &table,
            &notify::change_channel(&table),
            tracked,
        );
        sqlx::query(&create).execute(&mut **tx).await?;
        Ok(())
    }

    /// Apply the structural jump to `version`. Returns true when this
    /// accessor changed anything for that version.
    async fn upgrade(
        &self,
        _tx: &mut Transaction<'static, Postgres>,
        _schema: &SchemaName,
        _version: i32,
    ) -> Result<bool> {
        Ok(false)
    }

    // ---- query side -----------------------------------------------------

    /// Criteria-driven SELECT. Criteria must already be validated against
    /// this accessor's declaration.
    async fn find(
        &self,
        pool: &PgPool,
        schema: &SchemaName,
        criteria: &Criteria,
        options: &FindOptions,
    ) -> Result<Vec<Row>> {
        let stmt = sql::select(schema, &self.table(), criteria, options)?;
        let rows = stmt.query().fetch_all(pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value: Value = row.try_get("row")?;
            out.push(Row::from_value(value)?);
        }
        Ok(out)
    }

    /// Pure predicate removing rows the caller may not know about. Must
    /// not mutate rows; redaction belongs to `export`.
    fn filter(&self, rows: Vec<Row>, _credentials: &Credentials) -> Vec<Row> {
        rows
    }

    /// Caller-visible projection of each row.
    fn export(
        &self,
        rows: Vec<Row>,
        _credentials: &Credentials,
        options: &ExportOptions,
    ) -> Result<Vec<Value>> {
        Ok(rows
            .into_iter()
            .map(|mut row| {
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

    /// Validate and normalize one caller-submitted object against its
    /// stored original (`None` for creates). The default body enforces the
    /// base invariants; entity overrides call it first, then apply their
    /// own rules.
    async fn import(
        &self,
        _registry: &AccessorRegistry,
        pool: &PgPool,
        object: Row,
        original: Option<&Row>,
        credentials: &Credentials,
    ) -> Result<Row> {
        let _ = pool;
        import_base(object, original, credentials)
    }

    /// Persist objects within the caller's transaction. Per-row failures
    /// surface; a stale generation is a conflict, never a silent overwrite.
    async fn save(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        schema: &SchemaName,
        objects: &[Row],
    ) -> Result<Vec<Row>> {
        let mut saved = Vec::with_capacity(objects.len());
        for object in objects {
            let stmt = match (object.id(), object.gn()) {
                (Some(id), Some(gn)) => {
                    sql::update(schema, &self.table(), object, self.columns(), id, gn)?
                }
                (Some(id), None) => {
                    return Err(DataError::bad_request(format!(
                        "object {} lacks a generation number",
                        id
                    )))
                }
                (None, _) => sql::insert(schema, &self.table(), object, self.columns())?,
            };
            let row = stmt.query().fetch_optional(&mut **tx).await?;
            match row {
                Some(row) => {
                    let value: Value = row.try_get("row")?;
                    saved.push(Row::from_value(value)?);
                }
                None => {
                    // UPDATE matched nothing: the row moved underneath the
                    // caller (or never existed).
                    return Err(DataError::StaleGeneration {
                        id: object.id().unwrap_or(0),
                        gn: object.gn().unwrap_or(0),
                    });
                }
            }
        }
        Ok(saved)
    }

    /// Post-save side effects into related tables, same transaction.
    async fn associate(
        &self,
        _tx: &mut Transaction<'static, Postgres>,
        _schema: &SchemaName,
        _registry: &AccessorRegistry,
        _objects: &[Row],
        _originals: &[Option<Row>],
        _saved: &[Row],
        _credentials: &Credentials,
    ) -> Result<()> {
        Ok(())
    }

    /// Ask external integrations to refresh rows matching the criteria.
    /// Fire-and-forget: failures are logged, never surfaced.
    async fn sync(&self, pool: &PgPool, schema: &SchemaName, criteria: Value) {
        let channel = notify::sync_channel(&self.table());
        let payload = serde_json::json!({
            "schema": schema.as_str(),
            "criteria": criteria,
        });
        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&channel)
            .bind(payload.to_string())
            .execute(pool)
            .await;
        if let Err(err) = result {
            log::warn!("sync notification on {} failed: {}", channel, err);
        }
    }

    /// Permanently erase rows soft-deleted for longer than the window.
    async fn clean(
        &self,
        pool: &PgPool,
        schema: &SchemaName,
        preservation: chrono::Duration,
    ) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {}.{} WHERE \"deleted\" = true AND \"mtime\" < NOW() - $1::interval",
            schema.quoted(),
            self.table().quoted()
        );
        let result = sqlx::query(&sql)
            .bind(format!("{} seconds", preservation.num_seconds()))
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Base import invariants shared by every entity:
/// - an update must target its original (id match) and inherits the stored
///   generation number when the caller omitted it;
/// - a create must not carry an identifier;
/// - managed timestamps are never writable.
pub fn import_base(
    mut object: Row,
    original: Option<&Row>,
    _credentials: &Credentials,
) -> Result<Row> {
    object.remove("ctime");
    object.remove("mtime");
    match original {
        Some(original) => {
            if object.id() != original.id() {
                return Err(DataError::bad_request("object id does not match original"));
            }
            if object.gn().is_none() {
                if let Some(gn) = original.gn() {
                    object.set("gn", Value::from(gn));
                }
            }
        }
        None => {
            if object.id().is_some() {
                return Err(DataError::not_found("row does not exist"));
            }
            object.remove("gn");
        }
    }
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Access;
    use serde_json::json;

    fn creds() -> Credentials {
        Credentials {
            user_id: 7,
            project_id: Some(1),
            access: Access::Write,
            unrestricted: false,
            area: "client".to_string(),
        }
    }

    #[test]
    fn test_import_base_strips_timestamps() {
        let object = Row::from_value(json!({
            "ctime": "2025-01-01T00:00:00+00:00",
            "mtime": "2025-01-01T00:00:00+00:00",
            "type": "post"
        }))
        .unwrap();
        let imported = import_base(object, None, &creds()).unwrap();
        assert!(!imported.contains_key("ctime"));
        assert!(!imported.contains_key("mtime"));
    }

    #[test]
    fn test_import_base_inherits_generation() {
        let object = Row::from_value(json!({"id": 17, "type": "post"})).unwrap();
        let original = Row::from_value(json!({"id": 17, "gn": 4})).unwrap();
        let imported = import_base(object, Some(&original), &creds()).unwrap();
        assert_eq!(imported.gn(), Some(4));
    }

    #[test]
    fn test_import_base_keeps_submitted_generation() {
        let object = Row::from_value(json!({"id": 17, "gn": 3})).unwrap();
        let original = Row::from_value(json!({"id": 17, "gn": 4})).unwrap();
        let imported = import_base(object, Some(&original), &creds()).unwrap();
        // The stale value survives so save can report the conflict.
        assert_eq!(imported.gn(), Some(3));
    }

    #[test]
    fn test_import_base_rejects_id_mismatch() {
        let object = Row::from_value(json!({"id": 18})).unwrap();
        let original = Row::from_value(json!({"id": 17, "gn": 4})).unwrap();
        assert!(import_base(object, Some(&original), &creds()).is_err());
    }

    #[test]
    fn test_import_base_rejects_create_with_id() {
        let object = Row::from_value(json!({"id": 99})).unwrap();
        let err = import_base(object, None, &creds()).unwrap_err();
        assert_eq!(err.status_code(), 404);
    }
}
