//! Statistics accessor (project scope).
//!
//! Derived aggregate rows: keyed by a `filters` match descriptor, carrying
//! the dirty flag the invalidation engine flips and the sample/access
//! bookkeeping used to order invalidation batches. Rows are created and
//! recomputed by readers running unrestricted; callers cannot write them.

use crate::accessor::Accessor;
use crate::credentials::Credentials;
use crate::descriptor::{ColumnDef, ColumnKind, Scope};
use crate::registry::AccessorRegistry;
use async_trait::async_trait;
use sqlx::PgPool;
use trellis_commons::{CriteriaSet, CriteriaType, DataError, Result, Row, TableName};

const COLUMNS: &[ColumnDef] = &[
    ColumnDef::new("type", ColumnKind::Text).not_null("''"),
    ColumnDef::new("filters", ColumnKind::Jsonb).not_null("'{}'"),
    ColumnDef::new("sample_count", ColumnKind::Int).not_null("0"),
    ColumnDef::new("dirty", ColumnKind::Bool).not_null("true"),
    ColumnDef::new("atime", ColumnKind::Timestamp),
];

pub struct StatisticsAccessor {
    criteria: CriteriaSet,
}

impl StatisticsAccessor {
    pub fn new() -> Self {
        StatisticsAccessor {
            criteria: CriteriaSet::new()
                .with("id", CriteriaType::Int)
                .with("type", CriteriaType::Text)
                .with("dirty", CriteriaType::Bool),
        }
    }
}

impl Default for StatisticsAccessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Accessor for StatisticsAccessor {
    fn table(&self) -> TableName {
        TableName::literal("statistics")
    }

    fn scope(&self) -> Scope {
        Scope::Project
    }

    fn columns(&self) -> &[ColumnDef] {
        COLUMNS
    }

    fn criteria(&self) -> &CriteriaSet {
        &self.criteria
    }

    async fn import(
        &self,
        _registry: &AccessorRegistry,
        _pool: &PgPool,
        object: Row,
        original: Option<&Row>,
        credentials: &Credentials,
    ) -> Result<Row> {
        if !credentials.unrestricted {
            return Err(DataError::forbidden(
                "statistics are maintained by the system",
            ));
        }
        crate::accessor::import_base(object, original, credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Access;
    use serde_json::json;

    #[tokio::test]
    async fn test_callers_cannot_write_statistics() {
        let accessor = StatisticsAccessor::new();
        let registry = AccessorRegistry::standard();
        let pool = PgPool::connect_lazy("postgres://unused@localhost/unused").unwrap();
        let creds = Credentials {
            user_id: 7,
            project_id: Some(1),
            access: Access::Write,
            unrestricted: false,
            area: "client".to_string(),
        };
        let object = Row::from_value(json!({"type": "daily-activities"})).unwrap();
        let err = accessor
            .import(&registry, &pool, object, None, &creds)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }
}
