//! Schema lifecycle manager.
//!
//! Every tenant namespace is a Postgres schema built from the accessor
//! registry: one table per accessor of the matching scope, privileges per
//! configured role, a change trigger whose tracked-column list is derived
//! from the invalidation registry, and a single-row `meta` table holding
//! the structure version and an opaque signature. Creation is one
//! transaction; a partially built schema is never observable.
//!
//! Rename, retire and restore are single ALTER statements, so concurrent
//! callers race safely inside Postgres. Upgrades apply one version jump
//! per transaction and record the version only after the jump committed,
//! which makes an interrupted upgrade resumable.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use std::sync::Arc;
use trellis_commons::{DataError, Result, SchemaName};
use trellis_data::{Accessor, AccessorRegistry, Scope};
use trellis_live::InvalidationRegistry;
use trellis_store::{notify, Database};

/// Structural settings, loaded from the server config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Database roles granted full DML on every tenant table.
    #[serde(default)]
    pub grant_roles: Vec<String>,
}

pub struct SchemaManager {
    db: Database,
    registry: Arc<AccessorRegistry>,
    invalidation: InvalidationRegistry,
    config: SchemaConfig,
}

impl SchemaManager {
    pub fn new(
        db: Database,
        registry: Arc<AccessorRegistry>,
        invalidation: InvalidationRegistry,
        config: SchemaConfig,
    ) -> Self {
        SchemaManager {
            db,
            registry,
            invalidation,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AccessorRegistry> {
        &self.registry
    }

    fn scope_of(schema: &SchemaName) -> Scope {
        if schema.is_global() {
            Scope::Global
        } else {
            Scope::Project
        }
    }

    /// Columns the change trigger must preserve previous values for:
    /// whatever the invalidation registry declares for the table, plus the
    /// accessor's own filter columns. Both sets come from code, so the
    /// trigger configuration regenerates on every provisioning pass.
    fn tracked_for(&self, accessor: &Arc<dyn Accessor>) -> Vec<&'static str> {
        let table = accessor.table();
        let mut tracked = self.invalidation.tracked_columns(table.as_str());
        for column in accessor.filter_columns() {
            tracked.insert(column);
        }
        tracked.into_iter().collect()
    }

    /// Ensure the global schema exists; called once at startup. Creates it
    /// on first boot, otherwise only rolls upgrades forward.
    pub async fn bootstrap(&self) -> Result<()> {
        let global = SchemaName::global();
        if !self.schema_exists(&global).await? {
            log::info!("provisioning global schema");
            self.create_schema(&global).await?;
        }
        self.upgrade(&global).await?;
        Ok(())
    }

    pub async fn schema_exists(&self, schema: &SchemaName) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT schema_name FROM information_schema.schemata WHERE schema_name = $1",
        )
        .bind(schema.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.is_some())
    }

    /// Build a complete namespace in one transaction.
    pub async fn create_schema(&self, schema: &SchemaName) -> Result<()> {
        let scope = Self::scope_of(schema);
        let mut tx = self.db.begin().await?;
        sqlx::query(&format!("CREATE SCHEMA {}", schema.quoted()))
            .execute(&mut *tx)
            .await?;
        if schema.is_global() {
            notify::install(&mut *tx).await?;
        }
        for role in &self.config.grant_roles {
            let grant = format!(
                "GRANT USAGE ON SCHEMA {} TO \"{}\"",
                schema.quoted(),
                role
            );
            sqlx::query(&grant).execute(&mut *tx).await?;
            let sequences = format!(
                "ALTER DEFAULT PRIVILEGES IN SCHEMA {} GRANT USAGE ON SEQUENCES TO \"{}\"",
                schema.quoted(),
                role
            );
            sqlx::query(&sequences).execute(&mut *tx).await?;
        }
        for accessor in self.registry.for_scope(scope) {
            accessor.create(&mut tx, schema).await?;
            accessor
                .grant_privileges(&mut tx, schema, &self.config.grant_roles)
                .await?;
            let tracked = self.tracked_for(accessor);
            accessor.watch(&mut tx, schema, &tracked).await?;
        }
        self.create_meta(&mut tx, schema, self.registry.max_version(scope))
            .await?;
        tx.commit().await?;
        log::info!("created schema {}", schema);
        Ok(())
    }

    async fn create_meta(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        schema: &SchemaName,
        version: i32,
    ) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE {}.\"meta\" (version INT NOT NULL, signature TEXT NOT NULL)",
            schema.quoted()
        );
        sqlx::query(&ddl).execute(&mut **tx).await?;
        let insert = format!(
            "INSERT INTO {}.\"meta\" (version, signature) VALUES ($1, $2)",
            schema.quoted()
        );
        sqlx::query(&insert)
            .bind(version)
            .bind(new_signature())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn delete_schema(&self, schema: &SchemaName) -> Result<()> {
        let sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", schema.quoted());
        sqlx::query(&sql).execute(self.db.pool()).await?;
        log::info!("dropped schema {}", schema);
        Ok(())
    }

    pub async fn rename_schema(&self, from: &SchemaName, to: &SchemaName) -> Result<()> {
        // Already renamed by an earlier delivery of the same event
        if !self.schema_exists(from).await? && self.schema_exists(to).await? {
            return Ok(());
        }
        let sql = format!(
            "ALTER SCHEMA {} RENAME TO {}",
            from.quoted(),
            to.quoted()
        );
        sqlx::query(&sql).execute(self.db.pool()).await?;
        self.refresh_signature(to).await?;
        log::info!("renamed schema {} to {}", from, to);
        Ok(())
    }

    /// Park a namespace under the retired prefix. Data survives; the
    /// gateway stops resolving the live name.
    pub async fn retire_schema(&self, schema: &SchemaName) -> Result<()> {
        self.rename_schema(schema, &schema.retired()).await
    }

    pub async fn restore_schema(&self, schema: &SchemaName) -> Result<()> {
        self.rename_schema(&schema.retired(), &schema.restored()).await
    }

    /// Roll the namespace forward to the registry's declared version, one
    /// jump per transaction.
    pub async fn upgrade(&self, schema: &SchemaName) -> Result<()> {
        let scope = Self::scope_of(schema);
        let target = self.registry.max_version(scope);
        let current = self.version(schema).await?;
        for version in (current + 1)..=target {
            let mut tx = self.db.begin().await?;
            let mut changed = false;
            for accessor in self.registry.for_scope(scope) {
                if accessor.upgrade(&mut tx, schema, version).await? {
                    changed = true;
                    let tracked = self.tracked_for(accessor);
                    accessor.watch(&mut tx, schema, &tracked).await?;
                }
            }
            let update = format!(
                "UPDATE {}.\"meta\" SET version = $1, signature = $2",
                schema.quoted()
            );
            sqlx::query(&update)
                .bind(version)
                .bind(new_signature())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            if changed {
                log::info!("upgraded schema {} to version {}", schema, version);
            }
        }
        Ok(())
    }

    pub async fn version(&self, schema: &SchemaName) -> Result<i32> {
        let sql = format!("SELECT version FROM {}.\"meta\" LIMIT 1", schema.quoted());
        let row: Option<(i32,)> = sqlx::query_as(&sql).fetch_optional(self.db.pool()).await?;
        row.map(|(version,)| version)
            .ok_or_else(|| DataError::not_found(format!("schema {} has no meta row", schema)))
    }

    /// The namespace's structure signature. Changes whenever the schema is
    /// created, upgraded or renamed, so clients can cache against it.
    pub async fn signature(&self, schema: &SchemaName) -> Result<String> {
        let sql = format!("SELECT signature FROM {}.\"meta\" LIMIT 1", schema.quoted());
        let row: Option<(String,)> = sqlx::query_as(&sql).fetch_optional(self.db.pool()).await?;
        row.map(|(signature,)| signature)
            .ok_or_else(|| DataError::not_found(format!("schema {} has no meta row", schema)))
    }

    async fn refresh_signature(&self, schema: &SchemaName) -> Result<()> {
        let sql = format!("UPDATE {}.\"meta\" SET signature = $1", schema.quoted());
        sqlx::query(&sql)
            .bind(new_signature())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

/// Random 16-byte hex signature.
fn new_signature() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures_are_unique_hex() {
        let a = new_signature();
        let b = new_signature();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_scope_of_schema() {
        assert_eq!(SchemaManager::scope_of(&SchemaName::global()), Scope::Global);
        assert_eq!(
            SchemaManager::scope_of(&SchemaName::parse("acme").unwrap()),
            Scope::Project
        );
    }
}
