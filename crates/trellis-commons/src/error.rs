// Error types module
use thiserror::Error;

/// Main error type for Trellis data operations
///
/// Every variant maps onto one HTTP status class; the gateway performs the
/// final mapping so library crates never depend on the web framework.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Authentication required: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Stale generation: id={id}, gn={gn}")]
    StaleGeneration { id: i64, gn: i32 },

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DataError>;

impl DataError {
    /// Create an authentication error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        DataError::Unauthorized(msg.into())
    }

    /// Create a permission error
    pub fn forbidden<S: Into<String>>(msg: S) -> Self {
        DataError::Forbidden(msg.into())
    }

    /// Create a validation error
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        DataError::BadRequest(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        DataError::Conflict(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        DataError::NotFound(msg.into())
    }

    /// Create a schema not found error
    pub fn schema_not_found<S: Into<String>>(schema: S) -> Self {
        DataError::SchemaNotFound(schema.into())
    }

    /// Create a table not found error
    pub fn table_not_found<S: Into<String>>(table: S) -> Self {
        DataError::TableNotFound(table.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        DataError::Internal(msg.into())
    }

    /// HTTP status code this error classifies as
    pub fn status_code(&self) -> u16 {
        match self {
            DataError::Unauthorized(_) => 401,
            DataError::Forbidden(_) => 403,
            DataError::BadRequest(_) => 400,
            DataError::Conflict(_) | DataError::StaleGeneration { .. } => 409,
            DataError::NotFound(_)
            | DataError::SchemaNotFound(_)
            | DataError::TableNotFound(_) => 404,
            DataError::Database(_) | DataError::Serialization(_) | DataError::Internal(_) => 500,
        }
    }

    /// True when the message is safe to show to callers in production
    pub fn is_client_safe(&self) -> bool {
        self.status_code() < 500
    }

    /// True when a missing schema caused the failure; the gateway treats
    /// this one condition as recoverable on discovery (provision, then
    /// retry once). Store-level schema errors are classified into
    /// `SchemaNotFound` by the `sqlx::Error` conversion below.
    pub fn is_missing_schema(&self) -> bool {
        matches!(self, DataError::SchemaNotFound(_))
    }
}

impl From<sqlx::Error> for DataError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DataError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) => {
                // 23505 = unique_violation
                if db.code().as_deref() == Some("23505") {
                    DataError::Conflict(db.message().to_string())
                // 3F000 = invalid_schema_name, 42P01 = undefined_table;
                // either way the namespace is not provisioned under that
                // name, which is a not-found condition for callers
                } else if matches!(db.code().as_deref(), Some("3F000") | Some("42P01")) {
                    DataError::SchemaNotFound(db.message().to_string())
                } else {
                    DataError::Database(err)
                }
            }
            _ => DataError::Database(err),
        }
    }
}

impl From<String> for DataError {
    fn from(msg: String) -> Self {
        DataError::Internal(msg)
    }
}
