//! HTTP surface.
//!
//! Every data endpoint accepts GET and POST with parameters merged from
//! the query string and a JSON body (body wins); storage is POST only.
//! The binary mounts these behind a trailing-slash normalizer, so both
//! `/srv/data/discovery/acme/story` and `.../story/` resolve here.

use crate::service::{parse_ids, DataService};
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use trellis_commons::{DataError, Result, SchemaName};
use trellis_data::Credentials;

type ApiResult = std::result::Result<HttpResponse, crate::error::ApiError>;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz)).service(
        web::scope("/srv/data")
            .route("/signature/{schema}", web::get().to(signature))
            .route("/signature/{schema}", web::post().to(signature))
            .route("/discovery/{schema}/{table}", web::get().to(discovery))
            .route("/discovery/{schema}/{table}", web::post().to(discovery))
            .route("/retrieval/{schema}/{table}", web::get().to(retrieval))
            .route("/retrieval/{schema}/{table}", web::post().to(retrieval))
            .route("/retrieval/{schema}/{table}/{id}", web::get().to(retrieval_one))
            .route("/retrieval/{schema}/{table}/{id}", web::post().to(retrieval_one))
            .route("/storage/{schema}/{table}", web::post().to(storage)),
    );
}

async fn healthz(service: web::Data<DataService>) -> ApiResult {
    match service.health().await {
        Ok(()) => Ok(HttpResponse::Ok().json(json!({"status": "ok"}))),
        Err(err) => Err(service.api_error(err)),
    }
}

async fn signature(
    service: web::Data<DataService>,
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<HashMap<String, String>>,
    body: web::Bytes,
) -> ApiResult {
    let result = async {
        let schema = SchemaName::parse(&path)?;
        let (params, _) = merge_params(query.into_inner(), &body)?;
        let credentials = authenticate(&service, &req, &params, &schema).await?;
        service.signature(&schema, &credentials).await
    }
    .await;
    respond(&service, result)
}

async fn discovery(
    service: web::Data<DataService>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
    query: web::Query<HashMap<String, String>>,
    body: web::Bytes,
) -> ApiResult {
    let (schema, table) = path.into_inner();
    let result = async {
        let schema = SchemaName::parse(&schema)?;
        let (params, _) = merge_params(query.into_inner(), &body)?;
        let credentials = authenticate(&service, &req, &params, &schema).await?;
        service.discover(&schema, &table, &credentials, params).await
    }
    .await;
    respond(&service, result)
}

async fn retrieval(
    service: web::Data<DataService>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
    query: web::Query<HashMap<String, String>>,
    body: web::Bytes,
) -> ApiResult {
    let (schema, table) = path.into_inner();
    let result = async {
        let schema = SchemaName::parse(&schema)?;
        let (params, _) = merge_params(query.into_inner(), &body)?;
        let ids = match params.get("ids") {
            Some(value) => parse_ids(value)?,
            None => return Err(DataError::bad_request("no ids given")),
        };
        let credentials = authenticate(&service, &req, &params, &schema).await?;
        service
            .retrieve(&schema, &table, &credentials, ids, &params)
            .await
    }
    .await;
    respond(&service, result)
}

async fn retrieval_one(
    service: web::Data<DataService>,
    req: HttpRequest,
    path: web::Path<(String, String, i64)>,
    query: web::Query<HashMap<String, String>>,
    body: web::Bytes,
) -> ApiResult {
    let (schema, table, id) = path.into_inner();
    let result = async {
        let schema = SchemaName::parse(&schema)?;
        let (params, _) = merge_params(query.into_inner(), &body)?;
        let credentials = authenticate(&service, &req, &params, &schema).await?;
        service
            .retrieve(&schema, &table, &credentials, vec![id], &params)
            .await
    }
    .await;
    respond(&service, result)
}

async fn storage(
    service: web::Data<DataService>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
    query: web::Query<HashMap<String, String>>,
    body: web::Bytes,
) -> ApiResult {
    let (schema, table) = path.into_inner();
    let result = async {
        let schema = SchemaName::parse(&schema)?;
        let (params, objects) = merge_params(query.into_inner(), &body)?;
        let objects = match objects {
            Some(objects) => objects,
            None => match params.get("objects") {
                Some(Value::Array(objects)) => objects.clone(),
                _ => return Err(DataError::bad_request("no objects given")),
            },
        };
        let credentials = authenticate(&service, &req, &params, &schema).await?;
        service
            .store(&schema, &table, &credentials, objects, &params)
            .await
    }
    .await;
    respond(&service, result)
}

fn respond(service: &DataService, result: Result<Value>) -> ApiResult {
    match result {
        Ok(value) => Ok(HttpResponse::Ok().json(value)),
        Err(err) => Err(service.api_error(err)),
    }
}

/// Query parameters overlaid with a JSON body. A body that is itself an
/// array is the storage payload, not parameters.
fn merge_params(
    query: HashMap<String, String>,
    body: &[u8],
) -> Result<(Map<String, Value>, Option<Vec<Value>>)> {
    let mut params = Map::new();
    for (key, value) in query {
        params.insert(key, Value::String(value));
    }
    if body.is_empty() {
        return Ok((params, None));
    }
    let parsed = serde_json::from_slice::<Value>(body)
        .map_err(|err| DataError::bad_request(format!("malformed request body: {}", err)))?;
    match parsed {
        Value::Object(fields) => {
            for (key, value) in fields {
                params.insert(key, value);
            }
            Ok((params, None))
        }
        Value::Array(objects) => Ok((params, Some(objects))),
        other => Err(DataError::bad_request(format!(
            "request body must be an object or array, got {}",
            other
        ))),
    }
}

async fn authenticate(
    service: &DataService,
    req: &HttpRequest,
    params: &Map<String, Value>,
    schema: &SchemaName,
) -> Result<Credentials> {
    let token = params
        .get("token")
        .and_then(Value::as_str)
        .or_else(|| {
            req.headers()
                .get("x-auth-token")
                .and_then(|v| v.to_str().ok())
        })
        .ok_or_else(|| DataError::unauthorized("missing token"))?;
    crate::credentials::resolve(service.db().pool(), token, schema).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_params_body_wins() {
        let mut query = HashMap::new();
        query.insert("type".to_string(), "post".to_string());
        query.insert("limit".to_string(), "10".to_string());
        let body = json!({"type": "note"}).to_string();
        let (params, objects) = merge_params(query, body.as_bytes()).unwrap();
        assert_eq!(params.get("type"), Some(&json!("note")));
        assert_eq!(params.get("limit"), Some(&json!("10")));
        assert!(objects.is_none());
    }

    #[test]
    fn test_merge_params_array_body_is_payload() {
        let body = json!([{"type": "post"}]).to_string();
        let (params, objects) = merge_params(HashMap::new(), body.as_bytes()).unwrap();
        assert!(params.is_empty());
        assert_eq!(objects.unwrap().len(), 1);
    }

    #[test]
    fn test_merge_params_rejects_scalar_body() {
        assert!(merge_params(HashMap::new(), b"42").is_err());
    }
}
