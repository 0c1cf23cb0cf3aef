//! Validated identifiers for schemas and tables.
//!
//! Schema and table names end up interpolated into DDL and into
//! `SELECT ... FROM "schema"."table"` statements, so both are newtypes that
//! can only be constructed from strings matching a strict identifier
//! grammar. Everything else in the system passes these around by value.

use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the schema holding cross-tenant entities.
pub const GLOBAL_SCHEMA: &str = "global";

/// Prefix applied when a project schema is soft-retired.
pub const RETIRED_PREFIX: &str = "zombie$";

/// A validated Postgres schema name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaName(String);

impl SchemaName {
    /// Parse and validate a schema name.
    ///
    /// Accepts lowercase identifiers, optionally carrying the retired
    /// prefix. Rejects anything that could escape a quoted identifier.
    pub fn parse(name: &str) -> Result<Self> {
        let bare = name.strip_prefix(RETIRED_PREFIX).unwrap_or(name);
        if !is_valid_identifier(bare) {
            return Err(DataError::bad_request(format!(
                "invalid schema name: {}",
                name
            )));
        }
        Ok(SchemaName(name.to_string()))
    }

    /// The reserved global schema.
    pub fn global() -> Self {
        SchemaName(GLOBAL_SCHEMA.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_SCHEMA
    }

    pub fn is_retired(&self) -> bool {
        self.0.starts_with(RETIRED_PREFIX)
    }

    /// The retired counterpart of this name.
    pub fn retired(&self) -> SchemaName {
        if self.is_retired() {
            self.clone()
        } else {
            SchemaName(format!("{}{}", RETIRED_PREFIX, self.0))
        }
    }

    /// The live counterpart of a retired name.
    pub fn restored(&self) -> SchemaName {
        match self.0.strip_prefix(RETIRED_PREFIX) {
            Some(bare) => SchemaName(bare.to_string()),
            None => self.clone(),
        }
    }

    /// Double-quoted form for direct use in SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    pub fn parse(name: &str) -> Result<Self> {
        if !is_valid_identifier(name) {
            return Err(DataError::bad_request(format!(
                "invalid table name: {}",
                name
            )));
        }
        Ok(TableName(name.to_string()))
    }

    /// Construct from a string literal known at compile time to be valid.
    pub fn literal(name: &'static str) -> Self {
        debug_assert!(is_valid_identifier(name));
        TableName(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_valid_identifier(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_names() {
        assert!(SchemaName::parse("acme").is_ok());
        assert!(SchemaName::parse("acme_2").is_ok());
        assert!(TableName::parse("story").is_ok());
    }

    #[test]
    fn test_rejects_injection_attempts() {
        assert!(SchemaName::parse("acme\"; DROP SCHEMA x").is_err());
        assert!(SchemaName::parse("").is_err());
        assert!(SchemaName::parse("Acme").is_err());
        assert!(TableName::parse("story; --").is_err());
    }

    #[test]
    fn test_retire_restore_round_trip() {
        let name = SchemaName::parse("acme").unwrap();
        let retired = name.retired();
        assert_eq!(retired.as_str(), "zombie$acme");
        assert!(retired.is_retired());
        assert_eq!(retired.restored(), name);
        // Retiring twice is a no-op
        assert_eq!(retired.retired(), retired);
    }

    #[test]
    fn test_retired_names_parse() {
        let parsed = SchemaName::parse("zombie$acme").unwrap();
        assert!(parsed.is_retired());
    }

    #[test]
    fn test_global_schema() {
        assert!(SchemaName::global().is_global());
        assert!(!SchemaName::parse("acme").unwrap().is_global());
    }
}
