//! Background maintenance.
//!
//! One task owns all mutable state (`MaintenanceTask` is moved into its
//! loop; nothing is shared). Every tick it prunes the notification
//! overflow queue; once per day, inside the configured maintenance hour,
//! it hard-deletes rows that have been soft-deleted longer than the
//! preservation window, across every schema and accessor. Failures are
//! logged and retried on a later tick.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use trellis_commons::{Result, SchemaName};
use trellis_data::{AccessorRegistry, Scope};
use trellis_store::{queue, Database};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    /// Hour of day (UTC) when garbage collection may run.
    #[serde(default = "default_gc_hour")]
    pub gc_hour: u32,
    /// Days a soft-deleted row survives before hard deletion.
    #[serde(default = "default_preservation_days")]
    pub preservation_days: i64,
}

fn default_tick_seconds() -> u64 {
    300
}

fn default_gc_hour() -> u32 {
    4
}

fn default_preservation_days() -> i64 {
    30
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            tick_seconds: default_tick_seconds(),
            gc_hour: default_gc_hour(),
            preservation_days: default_preservation_days(),
        }
    }
}

pub struct MaintenanceTask {
    db: Database,
    registry: Arc<AccessorRegistry>,
    config: MaintenanceConfig,
    last_gc: Option<DateTime<Utc>>,
}

impl MaintenanceTask {
    pub fn new(db: Database, registry: Arc<AccessorRegistry>, config: MaintenanceConfig) -> Self {
        MaintenanceTask {
            db,
            registry,
            config,
            last_gc: None,
        }
    }

    /// Move the task onto the runtime; it runs until the process exits.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.tick_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    async fn tick(&mut self, now: DateTime<Utc>) {
        match queue::prune(self.db.pool(), queue::QUEUE_RETENTION).await {
            Ok(0) => {}
            Ok(pruned) => log::debug!("pruned {} queued notification(s)", pruned),
            Err(err) => log::warn!("queue pruning failed: {}", err),
        }
        if self.gc_due(now) {
            match self.collect_garbage().await {
                Ok(removed) => {
                    self.last_gc = Some(now);
                    log::info!("garbage collection removed {} row(s)", removed);
                }
                Err(err) => log::warn!("garbage collection failed: {}", err),
            }
        }
    }

    /// GC runs inside the configured hour, at most once per day.
    fn gc_due(&self, now: DateTime<Utc>) -> bool {
        if now.hour() != self.config.gc_hour {
            return false;
        }
        match self.last_gc {
            Some(last) => now - last >= Duration::hours(23),
            None => true,
        }
    }

    async fn collect_garbage(&self) -> Result<u64> {
        let preservation = Duration::days(self.config.preservation_days);
        let mut removed = 0u64;
        for schema in self.tenant_schemas().await? {
            let scope = if schema.is_global() {
                Scope::Global
            } else {
                Scope::Project
            };
            for accessor in self.registry.for_scope(scope) {
                match accessor.clean(self.db.pool(), &schema, preservation).await {
                    Ok(count) => removed += count,
                    Err(err) => log::warn!(
                        "cleaning {}.{} failed: {}",
                        schema,
                        accessor.table(),
                        err
                    ),
                }
            }
        }
        Ok(removed)
    }

    /// Every schema this deployment manages, retired ones included (their
    /// soft-deleted rows still age out).
    async fn tenant_schemas(&self) -> Result<Vec<SchemaName>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT schema_name FROM information_schema.schemata \
             WHERE schema_name NOT IN ('information_schema', 'public') \
             AND schema_name NOT LIKE 'pg\\_%'",
        )
        .fetch_all(self.db.pool())
        .await?;
        let mut schemas = Vec::with_capacity(rows.len());
        for (name,) in rows {
            match SchemaName::parse(&name) {
                Ok(schema) => schemas.push(schema),
                // Foreign schemas in a shared database are not ours
                Err(_) => continue,
            }
        }
        Ok(schemas)
    }
}
