//! Credential resolution.
//!
//! Every request presents a bearer token (session handle). Resolution
//! looks the session up, slides its expiry window, loads the user, and
//! computes the caller's coarse access level toward the target namespace.
//! The result lives for one request; nothing here is cached.

use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use trellis_commons::{DataError, Result, Row, SchemaName};
use trellis_data::entities::project;
use trellis_data::{Access, Credentials};

/// Sliding lifetime of an interactive (client) session.
fn interactive_lifetime() -> Duration {
    Duration::days(30)
}

/// Sliding lifetime of an automated (robot) session.
fn automated_lifetime() -> Duration {
    Duration::hours(4)
}

fn lifetime_for(area: &str) -> Duration {
    if area == "robot" {
        automated_lifetime()
    } else {
        interactive_lifetime()
    }
}

pub async fn resolve(pool: &PgPool, token: &str, schema: &SchemaName) -> Result<Credentials> {
    let session = load_session(pool, token).await?;
    let area = session.get_str("area").unwrap_or("client").to_string();
    extend_session(pool, &session, &area).await?;

    let user_id = session
        .get_i64("user_id")
        .ok_or_else(|| DataError::unauthorized("session has no user"))?;
    let user = load_user(pool, user_id).await?;
    let unrestricted = user.get_str("type") == Some("admin") && area == "admin";

    if schema.is_global() {
        // Global entities carry their own import rules; any authenticated
        // caller reaches the generic layer.
        return Ok(Credentials {
            user_id,
            project_id: None,
            access: Access::Write,
            unrestricted,
            area,
        });
    }
    if schema.is_retired() {
        return Err(DataError::schema_not_found(schema.as_str()));
    }
    let project = load_project(pool, schema).await?;
    let access = compute_access(&project, user_id);
    Ok(Credentials {
        user_id,
        project_id: project.id(),
        access,
        unrestricted,
        area,
    })
}

/// Membership grants write access; project settings may open read access
/// or directory visibility to everyone else.
fn compute_access(project: &Row, user_id: i64) -> Access {
    if project.get_i64_array("user_ids").contains(&user_id) {
        Access::Write
    } else if project::grants_view_to_non_members(project) {
        Access::Read
    } else if !project::is_unlisted(project) {
        Access::Know
    } else {
        Access::None
    }
}

async fn load_session(pool: &PgPool, token: &str) -> Result<Row> {
    let row: Option<(Value,)> = sqlx::query_as(
        r#"SELECT to_jsonb(t) FROM "global"."session" t
           WHERE "handle" = $1 AND "deleted" = false"#,
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;
    let session = match row {
        Some((value,)) => Row::from_value(value)?,
        None => return Err(DataError::unauthorized("unknown session")),
    };
    match session.get_str("etime") {
        Some(etime) => {
            let etime = chrono::DateTime::parse_from_rfc3339(etime)
                .map_err(|_| DataError::internal("unparseable session expiry"))?;
            if etime < Utc::now() {
                return Err(DataError::unauthorized("session expired"));
            }
        }
        None => return Err(DataError::unauthorized("session has no expiry")),
    }
    Ok(session)
}

/// Slide the expiry window. Plain column update; the generation number is
/// reserved for caller-visible edits.
async fn extend_session(pool: &PgPool, session: &Row, area: &str) -> Result<()> {
    let id = session
        .get_i64("id")
        .ok_or_else(|| DataError::internal("session row has no id"))?;
    let etime = Utc::now() + lifetime_for(area);
    sqlx::query(
        r#"UPDATE "global"."session" SET "etime" = $1, "mtime" = NOW() WHERE "id" = $2"#,
    )
    .bind(etime)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn load_user(pool: &PgPool, user_id: i64) -> Result<Row> {
    let row: Option<(Value,)> = sqlx::query_as(
        r#"SELECT to_jsonb(t) FROM "global"."user" t
           WHERE "id" = $1 AND "deleted" = false"#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    let user = match row {
        Some((value,)) => Row::from_value(value)?,
        None => return Err(DataError::unauthorized("unknown user")),
    };
    if user.get_bool("disabled") == Some(true) {
        return Err(DataError::unauthorized("user is disabled"));
    }
    Ok(user)
}

async fn load_project(pool: &PgPool, schema: &SchemaName) -> Result<Row> {
    let row: Option<(Value,)> = sqlx::query_as(
        r#"SELECT to_jsonb(t) FROM "global"."project" t
           WHERE "name" = $1 AND "deleted" = false"#,
    )
    .bind(schema.as_str())
    .fetch_optional(pool)
    .await?;
    match row {
        Some((value,)) => Row::from_value(value),
        None => Err(DataError::schema_not_found(schema.as_str())),
    }
}
