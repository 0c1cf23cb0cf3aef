//! Structural event coordinator.
//!
//! Subscribed to the structural notification channel, which carries
//! project-row transitions of `name` and `deleted`. Each transition maps
//! to exactly one schema lifecycle operation; the operations themselves
//! are idempotent against redelivery, so the coordinator applies them
//! blindly and logs failures. A failed operation is retried implicitly by
//! the gateway's provision-on-miss path.

use crate::manager::SchemaManager;
use async_trait::async_trait;
use std::sync::Arc;
use trellis_commons::{Result, SchemaName};
use trellis_live::{ChangeConsumer, ChangeEvent, ChangeOp};

pub struct SchemaCoordinator {
    manager: Arc<SchemaManager>,
}

impl SchemaCoordinator {
    pub fn new(manager: Arc<SchemaManager>) -> Self {
        SchemaCoordinator { manager }
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<()> {
        if event.table.as_str() != "project" {
            return Ok(());
        }
        let name = match event.current.get_str("name") {
            Some(name) => SchemaName::parse(name)?,
            None => return Ok(()),
        };
        match event.op {
            ChangeOp::Insert => {
                if !event.current.deleted() {
                    self.manager.create_schema(&name).await?;
                }
            }
            ChangeOp::Update => {
                let before = event.before_image();
                let was_deleted = before.deleted();
                let is_deleted = event.current.deleted();
                if !was_deleted && is_deleted {
                    // The live schema may still sit under the old name
                    // when a rename rode along; park it under the new one.
                    let live = match before.get_str("name") {
                        Some(old) if old != name.as_str() => SchemaName::parse(old)?,
                        _ => name.clone(),
                    };
                    self.manager.rename_schema(&live, &name.retired()).await?;
                    return Ok(());
                }
                // One event may carry both transitions; the parked schema
                // is under the old name, so restore first, then rename.
                if was_deleted && !is_deleted {
                    let parked = match before.get_str("name") {
                        Some(old) if old != name.as_str() => SchemaName::parse(old)?,
                        _ => name.clone(),
                    };
                    self.manager.restore_schema(&parked).await?;
                }
                if event.changed("name") {
                    match before.get_str("name") {
                        Some(old) if old != name.as_str() => {
                            let old = SchemaName::parse(old)?;
                            self.manager.rename_schema(&old, &name).await?;
                        }
                        // Name set for the first time
                        _ => self.manager.create_schema(&name).await?,
                    }
                }
            }
            ChangeOp::Delete => {
                // Hard deletes keep the data parked, same as soft retire
                self.manager.retire_schema(&name).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeConsumer for SchemaCoordinator {
    async fn consume(&self, _schema: SchemaName, events: Vec<ChangeEvent>) {
        for event in &events {
            if let Err(err) = self.apply(event).await {
                log::error!(
                    "structural event for project {:?} failed: {}",
                    event.id(),
                    err
                );
            }
        }
    }
}
