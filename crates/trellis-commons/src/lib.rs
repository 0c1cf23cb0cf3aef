// Trellis Commons
//
// Shared building blocks used by every Trellis crate: the error taxonomy,
// validated schema/table identifiers, the generic row model, the typed
// criteria (query filter) model, and the reusable backoff policy.

pub mod backoff;
pub mod criteria;
pub mod error;
pub mod ids;
pub mod row;

pub use backoff::BackoffPolicy;
pub use criteria::{Criteria, CriteriaSet, CriteriaType, CriteriaValue};
pub use error::{DataError, Result};
pub use ids::{SchemaName, TableName, GLOBAL_SCHEMA, RETIRED_PREFIX};
pub use row::Row;
