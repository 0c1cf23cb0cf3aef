//! Listing accessor (project scope).
//!
//! Curated, ordered membership sets (e.g. a news feed) derived from
//! stories and their statistics. Like statistics rows, listings are
//! system-maintained: the invalidation engine dirties them and readers
//! rebuild them.

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
    ColumnDef::new("dirty", ColumnKind::Bool).not_null("true"),
    ColumnDef::new("finalized", ColumnKind::Bool).not_null("true"),
    ColumnDef::new("atime", ColumnKind::Timestamp),
];

pub struct ListingAccessor {
    criteria: CriteriaSet,
}

impl ListingAccessor {
    pub fn new() -> Self {
        ListingAccessor {
            criteria: CriteriaSet::new()
                .with("id", CriteriaType::Int)
                .with("type", CriteriaType::Text)
                .with("dirty", CriteriaType::Bool),
        }
    }
}

impl Default for ListingAccessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Accessor for ListingAccessor {
    fn table(&self) -> TableName {
        TableName::literal("listing")
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
            return Err(DataError::forbidden("listings are maintained by the system"));
        }
        crate::accessor::import_base(object, original, credentials)
    }
}
