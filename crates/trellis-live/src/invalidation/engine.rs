//! The invalidation engine.
//!
//! Consumes change-event batches, decides relevance against the
//! descriptor registry, and flips dirty flags on matching statistics and
//! listing rows. Marking is idempotent (`WHERE dirty = false`), runs in
//! small batches, and prioritizes the least-sampled / least-recently-read
//! rows so wasted recomputation stays bounded under load.
//!
//! Failures are logged and dropped: the pipeline is best-effort by design,
//! and a reader that finds a stale-but-clean row only pays an extra
//! recomputation later.

use crate::event::ChangeEvent;
use crate::invalidation::descriptors::{filters_overlap, InvalidationRegistry};
use crate::router::ChangeConsumer;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row as SqlxRow;
use std::collections::HashMap;
use trellis_commons::{Result, SchemaName};
use trellis_store::Database;

/// Candidate rows examined per pass.
const CANDIDATE_WINDOW: i64 = 1000;
/// Rows flipped per UPDATE statement.
const MARK_BATCH: usize = 50;

pub struct InvalidationEngine {
    db: Database,
    registry: InvalidationRegistry,
}

impl InvalidationEngine {
    pub fn new(db: Database, registry: InvalidationRegistry) -> Self {
        InvalidationEngine { db, registry }
    }

    pub fn registry(&self) -> &InvalidationRegistry {
        &self.registry
    }

    async fn process(&self, schema: &SchemaName, events: &[ChangeEvent]) -> Result<()> {
        // Derived rows only exist in project namespaces
        if schema.is_global() || schema.is_retired() {
            return Ok(());
        }
        for event in events {
            for analyser in self.registry.analysers() {
                if analyser.is_relevant(event) {
                    let candidates = analyser.candidates(event);
                    let marked = self
                        .mark_dirty(schema, "statistics", analyser.statistic_type, &candidates)
                        .await?;
                    if marked > 0 {
                        log::debug!(
                            "{}: {} {} row(s) of {} marked dirty",
                            schema,
                            marked,
                            "statistics",
                            analyser.statistic_type
                        );
                    }
                }
            }
            for listing in self.registry.listings() {
                if listing.is_relevant(event) {
                    // Membership columns double as the match candidates
                    let mut candidates = HashMap::new();
                    for column in listing.membership_columns {
                        if let Some(value) = event.current.get(column) {
                            candidates
                                .entry((*column).to_string())
                                .or_insert_with(Vec::new)
                                .push(value.clone());
                        }
                    }
                    self.mark_dirty(schema, "listing", listing.listing_type, &candidates)
                        .await?;
                } else if listing.is_dirtied_by_statistic(event) {
                    // Rank source went dirty; match listings against the
                    // statistic row's own filters
                    let mut candidates = HashMap::new();
                    if let Some(Value::Object(filters)) = event.current.get("filters") {
                        for (key, value) in filters {
                            let values = match value {
                                Value::Array(items) => items.clone(),
                                single => vec![single.clone()],
                            };
                            candidates.insert(key.clone(), values);
                        }
                    }
                    self.mark_dirty(schema, "listing", listing.listing_type, &candidates)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Mark matching non-dirty derived rows dirty. Returns the count.
    async fn mark_dirty(
        &self,
        schema: &SchemaName,
        table: &str,
        kind: &str,
        candidates: &HashMap<String, Vec<Value>>,
    ) -> Result<u64> {
        let select = format!(
            "SELECT \"id\", \"filters\" FROM {}.\"{}\" \
             WHERE \"type\" = $1 AND \"dirty\" = false AND \"deleted\" = false \
             ORDER BY {} \"atime\" ASC NULLS FIRST LIMIT {}",
            schema.quoted(),
            table,
            if table == "statistics" {
                "\"sample_count\" ASC,"
            } else {
                ""
            },
            CANDIDATE_WINDOW
        );
        let rows = sqlx::query(&select)
            .bind(kind)
            .fetch_all(self.db.pool())
            .await?;
        let mut matched: Vec<i64> = Vec::new();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let filters: Value = row.try_get("filters")?;
            if filters_overlap(&filters, candidates) {
                matched.push(id);
            }
        }
        let update = format!(
            "UPDATE {}.\"{}\" SET \"dirty\" = true \
             WHERE \"id\" = ANY($1) AND \"dirty\" = false",
            schema.quoted(),
            table
        );
        let mut total = 0u64;
        for chunk in matched.chunks(MARK_BATCH) {
            let result = sqlx::query(&update)
                .bind(chunk)
                .execute(self.db.pool())
                .await?;
            total += result.rows_affected();
        }
        Ok(total)
    }
}

#[async_trait]
impl ChangeConsumer for InvalidationEngine {
    async fn consume(&self, schema: SchemaName, events: Vec<ChangeEvent>) {
        if let Err(err) = self.process(&schema, &events).await {
            log::warn!("invalidation pass for {} failed: {}", schema, err);
        }
    }
}
