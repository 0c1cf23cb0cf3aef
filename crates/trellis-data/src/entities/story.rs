//! Story accessor (project scope).
//!
//! Stories are the content rows: authored, optionally published, visible
//! according to publication state and project access. This accessor
//! carries the authorship rules, the publish-time stamping, and the
//! derived `role_ids` column (recomputed from the authors' roles).
//!
//! Declares version 2: the `tags` column arrived as an upgrade jump.

use crate::accessor::{import_base, Accessor};
use crate::credentials::{Access, Credentials};
use crate::descriptor::{ColumnDef, ColumnKind, Scope};
use crate::registry::AccessorRegistry;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use trellis_commons::{CriteriaSet, CriteriaType, DataError, Result, Row, SchemaName, TableName};

const COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("type", ColumnKind::Text).not_null("'post'"),
    ColumnDef::new("user_ids", ColumnKind::BigIntArray).not_null("'{}'"),
    ColumnDef::new("role_ids", ColumnKind::BigIntArray).not_null("'{}'"),
    ColumnDef::new("published", ColumnKind::Bool).not_null("false"),
    ColumnDef::new("ready", ColumnKind::Bool).not_null("false"),
    ColumnDef::new("public", ColumnKind::Bool).not_null("false"),
    ColumnDef::new("ptime", ColumnKind::Timestamp),
    ColumnDef::new("tags", ColumnKind::TextArray).not_null("'{}'"),
];

pub struct StoryAccessor {
    criteria: CriteriaSet,
}

impl StoryAccessor {
    pub fn new() -> Self {
        StoryAccessor {
            criteria: CriteriaSet::new()
                .with("id", CriteriaType::Int)
                .with("type", CriteriaType::Text)
                .with("user_ids", CriteriaType::IntArray)
                .with("role_ids", CriteriaType::IntArray)
                .with("published", CriteriaType::Bool)
                .with("public", CriteriaType::Bool)
                .with("ready", CriteriaType::Bool)
                .with("tags", CriteriaType::TextArray)
                .with("ptime", CriteriaType::TimeNewerThan),
        }
    }
}

impl Default for StoryAccessor {
    fn default() -> Self {
        Self::new()
    }
}

/// All referenced attachments ready? Resources without an explicit flag
/// (plain links) count as ready.
fn resources_ready(object: &Row) -> bool {
    match object.get("details").and_then(|d| d.get("resources")) {
        Some(Value::Array(resources)) => resources
            .iter()
            .all(|r| r.get("ready").and_then(Value::as_bool).unwrap_or(true)),
        _ => true,
    }
}

#[async_trait]
impl Accessor for StoryAccessor {
    fn table(&self) -> TableName {
        TableName::literal("story")
    }

    fn scope(&self) -> Scope {
        Scope::Project
    }

    fn version(&self) -> i32 {
        2
    }

    fn columns(&self) -> &[ColumnDef] {
        COLUMNS
    }

    fn criteria(&self) -> &CriteriaSet {
        &self.criteria
    }

    fn filter_columns(&self) -> &'static [&'static str] {
        &["user_ids", "published", "public"]
    }

    /// v2 added the `tags` column to existing namespaces.
    async fn upgrade(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        schema: &SchemaName,
        version: i32,
    ) -> Result<bool> {
        if version != 2 {
            return Ok(false);
        }
        let ddl = format!(
            "ALTER TABLE {}.{} ADD COLUMN IF NOT EXISTS \"tags\" TEXT[] NOT NULL DEFAULT '{{}}'",
            schema.quoted(),
            self.table().quoted()
        );
        sqlx::query(&ddl).execute(&mut **tx).await?;
        Ok(true)
    }

    /// Authors always see their own stories; others see published ones,
    /// non-public only with member-level access.
    fn filter(&self, rows: Vec<Row>, credentials: &Credentials) -> Vec<Row> {
        if credentials.unrestricted {
            return rows;
        }
        rows.into_iter()
            .filter(|row| {
                if row.get_i64_array("user_ids").contains(&credentials.user_id) {
                    return true;
                }
                if row.get_bool("published") != Some(true) {
                    return false;
                }
                row.get_bool("public") == Some(true) || credentials.access >= Access::Write
            })
            .collect()
    }

    async fn import(
        &self,
        _registry: &AccessorRegistry,
        pool: &PgPool,
        object: Row,
        original: Option<&Row>,
        credentials: &Credentials,
    ) -> Result<Row> {
        let mut object = import_base(object, original, credentials)?;

        // ptime is stamped by the system; role_ids is derived
        if !credentials.unrestricted {
            let prior_ptime = original.and_then(|o| o.get("ptime"));
            if let Some(ptime) = object.get("ptime") {
                if Some(ptime) != prior_ptime && !ptime.is_null() {
                    return Err(DataError::forbidden(
                        "setting ptime requires administrative access",
                    ));
                }
            }
            let prior_roles = original.and_then(|o| o.get("role_ids"));
            if let Some(role_ids) = object.get("role_ids") {
                if Some(role_ids) != prior_roles {
                    return Err(DataError::forbidden("role_ids is derived and read-only"));
                }
            }
        }

        let authors_changed;
        match original {
            None => {
                let authors = object.get_i64_array("user_ids");
                if authors.is_empty() {
                    return Err(DataError::bad_request("a story requires authors"));
                }
                if !credentials.unrestricted && !authors.contains(&credentials.user_id) {
                    return Err(DataError::forbidden(
                        "a story must list its creator as an author",
                    ));
                }
                authors_changed = true;
            }
            Some(original) => {
                let prior_authors = original.get_i64_array("user_ids");
                let is_author = prior_authors.contains(&credentials.user_id);
                let submitted_authors = object
                    .contains_key("user_ids")
                    .then(|| object.get_i64_array("user_ids"));
                authors_changed = matches!(&submitted_authors, Some(a) if *a != prior_authors);
                if !credentials.unrestricted {
                    if authors_changed && !is_author {
                        return Err(DataError::forbidden(
                            "only authors can change a story's author list",
                        ));
                    }
                    if object.get_bool("deleted") == Some(true)
                        && !original.deleted()
                        && !is_author
                    {
                        return Err(DataError::forbidden("only authors can delete a story"));
                    }
                }
                if authors_changed && submitted_authors.map_or(false, |a| a.is_empty()) {
                    return Err(DataError::bad_request("a story requires authors"));
                }
            }
        }

        // Implicit fields: readiness tracks the attachments; the publish
        // timestamp is stamped once the story is published and ready.
        if object.contains_key("details") || original.is_none() {
            object.set("ready", Value::Bool(resources_ready(&object)));
        }
        let published = object
            .get_bool("published")
            .or_else(|| original.and_then(|o| o.get_bool("published")))
            .unwrap_or(false);
        let ready = object
            .get_bool("ready")
            .or_else(|| original.and_then(|o| o.get_bool("ready")))
            .unwrap_or(false);
        let has_ptime = object
            .get("ptime")
            .or_else(|| original.and_then(|o| o.get("ptime")))
            .map(|v| !v.is_null())
            .unwrap_or(false);
        if published && ready && !has_ptime {
            object.set("ptime", Value::String(Utc::now().to_rfc3339()));
        }

        // Derive role_ids from the (possibly new) author set
        if authors_changed {
            let authors = object.get_i64_array("user_ids");
            let role_ids = derive_role_ids(pool, &authors).await?;
            object.set("role_ids", serde_json::to_value(role_ids)?);
        }
        Ok(object)
    }
}

/// Union of the given users' role references.
async fn derive_role_ids(pool: &PgPool, user_ids: &[i64]) -> Result<Vec<i64>> {
    let (role_ids,): (Vec<i64>,) = sqlx::query_as(
        r#"
        SELECT COALESCE(array_agg(DISTINCT rid ORDER BY rid), '{}')
        FROM "global"."user" u
        CROSS JOIN LATERAL unnest(u.role_ids) AS rid
        WHERE u.id = ANY($1) AND u.deleted = false
        "#,
    )
    .bind(user_ids)
    .fetch_one(pool)
    .await?;
    Ok(role_ids)
}
