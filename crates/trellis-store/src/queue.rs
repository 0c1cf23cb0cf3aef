//! Overflow notification queue.
//!
//! NOTIFY payloads are capped by Postgres, so oversized change events are
//! written to `global.message_queue` by the trigger function and fetched
//! here by the router. Rows have a bounded lifetime; the maintenance task
//! prunes anything older than the retention window.

use chrono::Duration;
use serde_json::Value;
use sqlx::PgPool;
use trellis_commons::Result;

/// Retention window for queued messages. Consumers fetch within seconds;
/// an hour covers listener restarts.
pub const QUEUE_RETENTION: Duration = Duration::hours(1);

/// Fetch a queued oversized payload by id. Returns `None` when the row has
/// already been pruned (the event is lost, which duplicates the NOTIFY
/// delivery guarantee — consumers must tolerate gaps).
pub async fn fetch(pool: &PgPool, queue_id: i64) -> Result<Option<Value>> {
    let row: Option<(Value,)> =
        sqlx::query_as(r#"SELECT message FROM "global"."message_queue" WHERE id = $1"#)
            .bind(queue_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(message,)| message))
}

/// Delete queue rows older than the retention window; returns the count.
pub async fn prune(pool: &PgPool, retention: Duration) -> Result<u64> {
    let result = sqlx::query(
        r#"DELETE FROM "global"."message_queue" WHERE ctime < NOW() - $1::interval"#,
    )
    .bind(format!("{} seconds", retention.num_seconds()))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
