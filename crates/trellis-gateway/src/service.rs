//! The four generic data operations.
//!
//! Everything table-specific is behind the accessor registry; this layer
//! owns request-shape validation, access-level checks, the
//! provision-and-retry-once path for schemas that do not exist yet, and
//! the save/associate transaction bracket.

use crate::config::GatewayConfig;
use crate::error::ApiError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use trellis_commons::{
    Criteria, CriteriaType, CriteriaValue, DataError, Result, Row, SchemaName,
};
use trellis_data::{
    Access, AccessorRegistry, ColumnSelection, Credentials, ExportOptions, FindOptions, Scope,
    DEFAULT_RESULT_LIMIT,
};
use trellis_schema::SchemaManager;
use trellis_store::Database;

static ORDER_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\w+\s+(asc|desc)$").expect("hard-coded pattern"));

/// Reserved parameter names that shape a request instead of filtering it.
const RESERVED_PARAMS: &[&str] = &[
    "token",
    "order",
    "limit",
    "include_deleted",
    "include_ctime",
    "include_mtime",
    "ids",
    "objects",
];

#[derive(Clone)]
pub struct DataService {
    db: Database,
    registry: Arc<AccessorRegistry>,
    manager: Arc<SchemaManager>,
    config: GatewayConfig,
}

impl DataService {
    pub fn new(
        db: Database,
        registry: Arc<AccessorRegistry>,
        manager: Arc<SchemaManager>,
        config: GatewayConfig,
    ) -> Self {
        DataService {
            db,
            registry,
            manager,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Attach the deployment's redaction policy to an error.
    pub fn api_error(&self, error: DataError) -> ApiError {
        ApiError::new(error, self.config.development)
    }

    pub async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.db.pool()).await?;
        Ok(())
    }

    // ---- signature ------------------------------------------------------

    /// Opaque change-detection token: schema signature plus the caller's
    /// classification, so a membership change also changes the token.
    pub async fn signature(
        &self,
        schema: &SchemaName,
        credentials: &Credentials,
    ) -> Result<Value> {
        if !credentials.can_know() {
            return Err(DataError::forbidden("no access to this namespace"));
        }
        let signature = self.manager.signature(schema).await?;
        let caller = if credentials.unrestricted {
            "admin"
        } else {
            "user"
        };
        let access = match credentials.access {
            Access::None => "n",
            Access::Know => "k",
            Access::Read => "r",
            Access::Write => "w",
        };
        Ok(json!({ "signature": format!("{}-{}-{}", signature, caller, access) }))
    }

    // ---- discovery ------------------------------------------------------

    pub async fn discover(
        &self,
        schema: &SchemaName,
        table: &str,
        credentials: &Credentials,
        mut params: Map<String, Value>,
    ) -> Result<Value> {
        let accessor = self.accessor_for(schema, table, credentials)?;
        if !credentials.can_read() {
            return Err(DataError::forbidden("no read access to this namespace"));
        }
        let order = match params.get("order").and_then(Value::as_str) {
            Some(order) => Some(validate_order(order)?),
            None => None,
        };
        let limit = param_i64(&params, "limit")?;
        let include_deleted = param_bool(&params, "include_deleted")?;
        if include_deleted && !credentials.unrestricted {
            return Err(DataError::forbidden(
                "deleted rows are visible to administrators only",
            ));
        }
        for key in RESERVED_PARAMS {
            params.remove(*key);
        }
        let criteria = accessor.criteria().validate(&params)?;
        let options = FindOptions {
            columns: ColumnSelection::IdGnPlus(accessor.filter_columns().to_vec()),
            order,
            include_deleted,
            ..FindOptions::default()
        }
        .with_limit(limit);

        let rows = match accessor.find(self.db.pool(), schema, &criteria, &options).await {
            Err(err) if err.is_missing_schema() => {
                self.provision(schema).await?;
                accessor.find(self.db.pool(), schema, &criteria, &options).await?
            }
            other => other?,
        };
        let rows = accessor.filter(rows, credentials);
        let ids: Vec<i64> = rows.iter().filter_map(Row::id).collect();
        let gns: Vec<i32> = rows.iter().filter_map(Row::gn).collect();
        Ok(json!({ "ids": ids, "gns": gns }))
    }

    // ---- retrieval ------------------------------------------------------

    pub async fn retrieve(
        &self,
        schema: &SchemaName,
        table: &str,
        credentials: &Credentials,
        ids: Vec<i64>,
        params: &Map<String, Value>,
    ) -> Result<Value> {
        let accessor = self.accessor_for(schema, table, credentials)?;
        if !credentials.can_read() {
            return Err(DataError::forbidden("no read access to this namespace"));
        }
        if ids.is_empty() {
            return Err(DataError::bad_request("no ids given"));
        }
        if ids.len() as i64 > DEFAULT_RESULT_LIMIT {
            return Err(DataError::bad_request(format!(
                "retrieval batch exceeds {} ids",
                DEFAULT_RESULT_LIMIT
            )));
        }
        let include_deleted = param_bool(params, "include_deleted")?;
        if include_deleted && !credentials.unrestricted {
            return Err(DataError::forbidden(
                "deleted rows are visible to administrators only",
            ));
        }
        let mut criteria = Criteria::new();
        criteria.push("id", CriteriaType::Int, CriteriaValue::IntList(ids));
        let options = FindOptions {
            include_deleted,
            ..FindOptions::default()
        };
        let rows = accessor
            .find(self.db.pool(), schema, &criteria, &options)
            .await?;
        let rows = accessor.filter(rows, credentials);
        let exported = accessor.export(rows, credentials, &export_options(params)?)?;
        Ok(Value::Array(exported))
    }

    // ---- storage --------------------------------------------------------

    pub async fn store(
        &self,
        schema: &SchemaName,
        table: &str,
        credentials: &Credentials,
        objects: Vec<Value>,
        params: &Map<String, Value>,
    ) -> Result<Value> {
        let accessor = self.accessor_for(schema, table, credentials)?;
        if !credentials.can_write() {
            return Err(DataError::forbidden("no write access to this namespace"));
        }
        if objects.is_empty() {
            return Err(DataError::bad_request("no objects given"));
        }
        if objects.len() as i64 > DEFAULT_RESULT_LIMIT {
            return Err(DataError::bad_request(format!(
                "storage batch exceeds {} objects",
                DEFAULT_RESULT_LIMIT
            )));
        }
        let mut submitted = Vec::with_capacity(objects.len());
        for object in objects {
            submitted.push(Row::from_value(object).map_err(|_| {
                DataError::bad_request("each stored object must be a JSON object")
            })?);
        }

        // Originals for every id present; deleted ones included so an
        // undelete round-trips.
        let ids: Vec<i64> = submitted.iter().filter_map(Row::id).collect();
        let mut originals_by_id: HashMap<i64, Row> = HashMap::new();
        if !ids.is_empty() {
            let mut criteria = Criteria::new();
            criteria.push("id", CriteriaType::Int, CriteriaValue::IntList(ids));
            let options = FindOptions {
                include_deleted: true,
                ..FindOptions::default()
            };
            let rows = accessor
                .find(self.db.pool(), schema, &criteria, &options)
                .await?;
            for row in rows {
                if let Some(id) = row.id() {
                    originals_by_id.insert(id, row);
                }
            }
        }

        let mut originals: Vec<Option<Row>> = Vec::with_capacity(submitted.len());
        let mut imported = Vec::with_capacity(submitted.len());
        for object in submitted {
            let original = object.id().and_then(|id| originals_by_id.get(&id)).cloned();
            let row = accessor
                .import(
                    &self.registry,
                    self.db.pool(),
                    object,
                    original.as_ref(),
                    credentials,
                )
                .await?;
            imported.push(row);
            originals.push(original);
        }

        // Transaction bracket: save and associate commit together or not
        // at all (dropping the transaction rolls it back).
        let mut tx = self.db.begin().await?;
        let saved = accessor.save(&mut tx, schema, &imported).await?;
        accessor
            .associate(
                &mut tx,
                schema,
                &self.registry,
                &imported,
                &originals,
                &saved,
                credentials,
            )
            .await?;
        tx.commit().await?;

        let exported = accessor.export(saved, credentials, &export_options(params)?)?;
        Ok(Value::Array(exported))
    }

    // ---- shared ---------------------------------------------------------

    fn accessor_for(
        &self,
        schema: &SchemaName,
        table: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn trellis_data::Accessor>> {
        let scope = if schema.is_global() {
            Scope::Global
        } else {
            Scope::Project
        };
        let accessor = self.registry.get_scoped(table, scope)?;
        // Restricted tables do not exist for regular callers
        if accessor.restricted() && !credentials.unrestricted {
            return Err(DataError::table_not_found(table));
        }
        Ok(accessor)
    }

    /// Bring a namespace into existence (or up to date) after a query hit
    /// a missing schema or table. Only namespaces backed by a live project
    /// row qualify.
    async fn provision(&self, schema: &SchemaName) -> Result<()> {
        if schema.is_global() {
            return self.manager.upgrade(schema).await;
        }
        let project: Option<(i64,)> = sqlx::query_as(
            r#"SELECT "id" FROM "global"."project" WHERE "name" = $1 AND "deleted" = false"#,
        )
        .bind(schema.as_str())
        .fetch_optional(self.db.pool())
        .await?;
        if project.is_none() {
            return Err(DataError::schema_not_found(schema.as_str()));
        }
        if self.manager.schema_exists(schema).await? {
            self.manager.upgrade(schema).await
        } else {
            self.manager.create_schema(schema).await
        }
    }
}

/// Validate a caller-supplied ordering: one or more comma-separated
/// `column asc|desc` clauses, nothing else. Returns the normalized
/// clause list ready for the ORDER BY.
fn validate_order(order: &str) -> Result<String> {
    let mut clauses = Vec::new();
    for clause in order.split(',') {
        let clause = clause.trim();
        if !ORDER_CLAUSE.is_match(clause) {
            return Err(DataError::bad_request(format!(
                "invalid order clause: {}",
                order
            )));
        }
        clauses.push(clause);
    }
    Ok(clauses.join(", "))
}

fn export_options(params: &Map<String, Value>) -> Result<ExportOptions> {
    Ok(ExportOptions {
        include_ctime: param_bool(params, "include_ctime")?,
        include_mtime: param_bool(params, "include_mtime")?,
    })
}

fn param_bool(params: &Map<String, Value>, key: &str) -> Result<bool> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::String(s)) if s == "true" || s == "false" => Ok(s == "true"),
        Some(other) => Err(DataError::bad_request(format!(
            "invalid value for {}: {}",
            key, other
        ))),
    }
}

fn param_i64(params: &Map<String, Value>, key: &str) -> Result<Option<i64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| DataError::bad_request(format!("invalid value for {}", key))),
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map(Some)
            .map_err(|_| DataError::bad_request(format!("invalid value for {}: {}", key, s))),
        Some(other) => Err(DataError::bad_request(format!(
            "invalid value for {}: {}",
            key, other
        ))),
    }
}

/// Parse the ids a retrieval names: a path segment, a JSON array, or a
/// comma-separated query value.
pub fn parse_ids(value: &Value) -> Result<Vec<i64>> {
    let invalid = || DataError::bad_request(format!("invalid ids: {}", value));
    match value {
        Value::Number(n) => n.as_i64().map(|id| vec![id]).ok_or_else(invalid),
        Value::Array(items) => {
            let mut ids = Vec::with_capacity(items.len());
            for item in items {
                ids.push(item.as_i64().ok_or_else(invalid)?);
            }
            Ok(ids)
        }
        Value::String(s) => {
            let mut ids = Vec::new();
            for part in s.split(',') {
                ids.push(part.trim().parse::<i64>().map_err(|_| invalid())?);
            }
            Ok(ids)
        }
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_live::InvalidationRegistry;

    fn service() -> DataService {
        let pool = sqlx::PgPool::connect_lazy("postgres://unused@localhost/unused").unwrap();
        let db = Database::from_pool(pool);
        let registry = Arc::new(AccessorRegistry::standard());
        let manager = Arc::new(SchemaManager::new(
            db.clone(),
            Arc::clone(&registry),
            InvalidationRegistry::standard(),
            Default::default(),
        ));
        DataService::new(db, registry, manager, GatewayConfig::default())
    }

    fn creds(access: Access, unrestricted: bool) -> Credentials {
        Credentials {
            user_id: 7,
            project_id: Some(1),
            access,
            unrestricted,
            area: "client".to_string(),
        }
    }

    fn acme() -> SchemaName {
        SchemaName::parse("acme").unwrap()
    }

    #[tokio::test]
    async fn test_discover_requires_read_access() {
        let service = service();
        let err = service
            .discover(&acme(), "story", &creds(Access::Know, false), Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_discover_rejects_bad_order_before_querying() {
        let service = service();
        let mut params = Map::new();
        params.insert("order".to_string(), json!("id; DROP TABLE x"));
        let err = service
            .discover(&acme(), "story", &creds(Access::Read, false), params)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_discover_include_deleted_is_privileged() {
        let service = service();
        let mut params = Map::new();
        params.insert("include_deleted".to_string(), json!(true));
        let err = service
            .discover(&acme(), "story", &creds(Access::Write, false), params)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_retrieve_caps_batch_before_querying() {
        let service = service();
        let ids: Vec<i64> = (1..=(DEFAULT_RESULT_LIMIT + 1)).collect();
        let err = service
            .retrieve(&acme(), "story", &creds(Access::Read, false), ids, &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_store_requires_write_access() {
        let service = service();
        let err = service
            .store(
                &acme(),
                "story",
                &creds(Access::Read, false),
                vec![json!({"type": "post"})],
                &Map::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_store_rejects_empty_batch() {
        let service = service();
        let err = service
            .store(&acme(), "story", &creds(Access::Write, false), vec![], &Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_restricted_table_is_invisible() {
        let service = service();
        let err = service
            .discover(
                &SchemaName::global(),
                "session",
                &creds(Access::Write, false),
                Map::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_scope_mismatch_is_unknown_table() {
        let service = service();
        let err = service
            .discover(&acme(), "user", &creds(Access::Write, false), Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_order_clause_validation() {
        assert_eq!(validate_order("ptime desc").unwrap(), "ptime desc");
        assert_eq!(validate_order("ptime desc, id asc").unwrap(), "ptime desc, id asc");
        // Normalizes spacing around the separator
        assert_eq!(validate_order("ptime desc,id asc").unwrap(), "ptime desc, id asc");
        assert!(validate_order("id; DROP TABLE x").is_err());
        assert!(validate_order("id").is_err());
        assert!(validate_order("id descending").is_err());
        // A trailing separator leaves an empty clause
        assert!(validate_order("ptime desc,").is_err());
        assert!(validate_order("").is_err());
    }

    #[test]
    fn test_parse_ids_accepts_all_shapes() {
        assert_eq!(parse_ids(&json!(17)).unwrap(), vec![17]);
        assert_eq!(parse_ids(&json!([1, 2, 3])).unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_ids(&json!("4, 5,6")).unwrap(), vec![4, 5, 6]);
        assert!(parse_ids(&json!("4,five")).is_err());
        assert!(parse_ids(&json!({"id": 1})).is_err());
    }

    #[test]
    fn test_param_coercions() {
        let params = json!({"limit": "200", "include_deleted": "true"});
        let params = params.as_object().unwrap();
        assert_eq!(param_i64(params, "limit").unwrap(), Some(200));
        assert!(param_bool(params, "include_deleted").unwrap());
        assert!(!param_bool(params, "include_ctime").unwrap());
        let bad = json!({"limit": [1]});
        assert!(param_i64(bad.as_object().unwrap(), "limit").is_err());
    }
}
