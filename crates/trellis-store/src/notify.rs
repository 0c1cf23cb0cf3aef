//! Change-notification trigger infrastructure.
//!
//! A single generic PL/pgSQL function serves every watched table. Trigger
//! arguments carry the target channel followed by the tracked column list,
//! so the sparse "previous" image in each payload contains exactly the
//! columns the invalidation registry declared — the two sets are generated
//! from one source and cannot drift apart.
//!
//! Payloads larger than the NOTIFY limit are parked in
//! `global.message_queue` and referenced by id; the router fetches them on
//! receipt. Queue rows are pruned by the maintenance task.

use sqlx::{Executor, PgConnection};
use trellis_commons::{Result, TableName};

/// Channel carrying structural project events (rename, retire, restore).
pub const SCHEMA_EVENT_CHANNEL: &str = "schema_event";

/// Channel carrying row changes for one table.
pub fn change_channel(table: &TableName) -> String {
    format!("change_{}", table.as_str())
}

/// Channel asking external integrations to refresh one table's data.
pub fn sync_channel(table: &TableName) -> String {
    format!("sync_{}", table.as_str())
}

/// Largest payload sent inline through NOTIFY; Postgres caps payloads at
/// 8000 bytes, so anything near that goes through the overflow queue.
const INLINE_PAYLOAD_LIMIT: i32 = 7800;

/// Install the trigger function and the overflow queue table. Idempotent;
/// runs inside the caller's transaction during global-schema provisioning.
pub async fn install(conn: &mut PgConnection) -> Result<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS "global"."message_queue" (
            id BIGSERIAL PRIMARY KEY,
            message JSONB NOT NULL,
            ctime TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .await?;
    conn.execute(notify_function_sql().as_str()).await?;
    Ok(())
}

fn notify_function_sql() -> String {
    format!(
        r#"
        CREATE OR REPLACE FUNCTION "global"."notify_change"() RETURNS trigger AS $trig$
        DECLARE
            channel TEXT := TG_ARGV[0];
            previous JSONB := '{{}}'::jsonb;
            payload JSONB;
            col TEXT;
            i INT;
            queue_id BIGINT;
        BEGIN
            IF TG_OP = 'UPDATE' THEN
                FOR i IN 1..(TG_NARGS - 1) LOOP
                    col := TG_ARGV[i];
                    IF to_jsonb(OLD)->col IS DISTINCT FROM to_jsonb(NEW)->col THEN
                        previous := previous || jsonb_build_object(col, to_jsonb(OLD)->col);
                    END IF;
                END LOOP;
                payload := jsonb_build_object(
                    'op', 'UPDATE',
                    'schema', TG_TABLE_SCHEMA,
                    'table', TG_TABLE_NAME,
                    'current', to_jsonb(NEW),
                    'previous', previous);
            ELSIF TG_OP = 'INSERT' THEN
                payload := jsonb_build_object(
                    'op', 'INSERT',
                    'schema', TG_TABLE_SCHEMA,
                    'table', TG_TABLE_NAME,
                    'current', to_jsonb(NEW),
                    'previous', previous);
            ELSE
                payload := jsonb_build_object(
                    'op', 'DELETE',
                    'schema', TG_TABLE_SCHEMA,
                    'table', TG_TABLE_NAME,
                    'current', to_jsonb(OLD),
                    'previous', previous);
            END IF;
            IF octet_length(payload::text) > {limit} THEN
                INSERT INTO "global"."message_queue" (message) VALUES (payload)
                    RETURNING id INTO queue_id;
                PERFORM pg_notify(channel, jsonb_build_object('queued', queue_id)::text);
            ELSE
                PERFORM pg_notify(channel, payload::text);
            END IF;
            RETURN NULL;
        END
        $trig$ LANGUAGE plpgsql
        "#,
        limit = INLINE_PAYLOAD_LIMIT
    )
}

/// DDL attaching the change trigger to one table. `tracked` is the column
/// list whose previous values the payload must preserve.
pub fn watch_trigger_sql(
    trigger_name: &str,
    schema_quoted: &str,
    table: &TableName,
    channel: &str,
    tracked: &[&str],
) -> String {
    let mut args: Vec<String> = Vec::with_capacity(tracked.len() + 1);
    args.push(format!("'{}'", channel));
    for col in tracked {
        args.push(format!("'{}'", col));
    }
    format!(
        r#"
        CREATE TRIGGER "{name}"
            AFTER INSERT OR UPDATE OR DELETE ON {schema}.{table}
            FOR EACH ROW EXECUTE FUNCTION "global"."notify_change"({args})
        "#,
        name = trigger_name,
        schema = schema_quoted,
        table = table.quoted(),
        args = args.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        let table = TableName::literal("story");
        assert_eq!(change_channel(&table), "change_story");
        assert_eq!(sync_channel(&table), "sync_story");
    }

    #[test]
    fn test_watch_trigger_sql_includes_tracked_columns() {
        let sql = watch_trigger_sql(
            "story_notify",
            "\"acme\"",
            &TableName::literal("story"),
            "change_story",
            &["published", "user_ids"],
        );
        assert!(sql.contains("'change_story', 'published', 'user_ids'"));
        assert!(sql.contains("\"acme\".\"story\""));
    }
}
