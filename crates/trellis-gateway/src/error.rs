//! Error-to-response mapping.
//!
//! The library taxonomy already classifies every error by status code;
//! this wrapper adds the one gateway concern: internal messages are
//! redacted unless the deployment runs in development mode.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use trellis_commons::DataError;

#[derive(Debug)]
pub struct ApiError {
    error: DataError,
    expose_internal: bool,
}

impl ApiError {
    pub fn new(error: DataError, expose_internal: bool) -> Self {
        ApiError {
            error,
            expose_internal,
        }
    }

    fn message(&self) -> String {
        if self.error.is_client_safe() || self.expose_internal {
            self.error.to_string()
        } else {
            "internal error".to_string()
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        if !self.error.is_client_safe() {
            log::error!("request failed: {}", self.error);
        }
        HttpResponse::build(self.status_code()).json(json!({ "message": self.message() }))
    }
}
