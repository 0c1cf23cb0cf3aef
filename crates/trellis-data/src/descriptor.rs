//! Declarative entity metadata.
//!
//! Each accessor describes its table once: owning scope, column set with
//! semantic types, accepted criteria keys, and the version gating schema
//! upgrades. The descriptors are static — registered at process start and
//! immutable thereafter.

/// Which class of namespace owns an entity's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Lives in the reserved "global" schema (users, projects, sessions...).
    Global,
    /// Lives in every project schema (stories, statistics, listings...).
    Project,
}

/// Semantic column type; drives DDL generation and value binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    BigInt,
    Int,
    Text,
    Bool,
    Timestamp,
    BigIntArray,
    TextArray,
    Jsonb,
}

impl ColumnKind {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::BigInt => "BIGINT",
            ColumnKind::Int => "INT",
            ColumnKind::Text => "TEXT",
            ColumnKind::Bool => "BOOLEAN",
            ColumnKind::Timestamp => "TIMESTAMPTZ",
            ColumnKind::BigIntArray => "BIGINT[]",
            ColumnKind::TextArray => "TEXT[]",
            ColumnKind::Jsonb => "JSONB",
        }
    }
}

/// One entity-specific column (beyond the base set every table carries).
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub not_null: bool,
    pub default: Option<&'static str>,
    pub unique: bool,
}

impl ColumnDef {
    pub const fn new(name: &'static str, kind: ColumnKind) -> Self {
        ColumnDef {
            name,
            kind,
            not_null: false,
            default: None,
            unique: false,
        }
    }

    pub const fn not_null(mut self, default: &'static str) -> Self {
        self.not_null = true;
        self.default = Some(default);
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn ddl(&self) -> String {
        let mut parts = vec![format!("\"{}\" {}", self.name, self.kind.sql_type())];
        if self.not_null {
            parts.push("NOT NULL".to_string());
        }
        if let Some(default) = self.default {
            parts.push(format!("DEFAULT {}", default));
        }
        if self.unique {
            parts.push("UNIQUE".to_string());
        }
        parts.join(" ")
    }
}

/// Result cap: the default and the ceiling a caller can never raise.
pub const DEFAULT_RESULT_LIMIT: i64 = 5000;

/// Which columns a `find` should fetch.
#[derive(Debug, Clone)]
pub enum ColumnSelection {
    /// Full row image.
    All,
    /// `id` + `gn` plus the named columns (the accessor's filter columns).
    IdGnPlus(Vec<&'static str>),
}

/// Options shaping one `find` call.
#[derive(Debug, Clone)]
pub struct FindOptions {
    pub columns: ColumnSelection,
    /// Validated `ORDER BY` clause text; defaults to `id DESC`.
    pub order: Option<String>,
    pub limit: i64,
    pub include_deleted: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        FindOptions {
            columns: ColumnSelection::All,
            order: None,
            limit: DEFAULT_RESULT_LIMIT,
            include_deleted: false,
        }
    }
}

impl FindOptions {
    /// Clamp a caller-supplied limit; the ceiling cannot be raised.
    pub fn with_limit(mut self, requested: Option<i64>) -> Self {
        if let Some(limit) = requested {
            self.limit = limit.clamp(1, DEFAULT_RESULT_LIMIT);
        }
        self
    }
}

/// Options shaping one `export` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    pub include_ctime: bool,
    pub include_mtime: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_ddl() {
        let col = ColumnDef::new("published", ColumnKind::Bool).not_null("false");
        assert_eq!(col.ddl(), "\"published\" BOOLEAN NOT NULL DEFAULT false");
        let col = ColumnDef::new("name", ColumnKind::Text).unique();
        assert_eq!(col.ddl(), "\"name\" TEXT UNIQUE");
    }

    #[test]
    fn test_limit_clamping() {
        let opts = FindOptions::default().with_limit(Some(100));
        assert_eq!(opts.limit, 100);
        let opts = FindOptions::default().with_limit(Some(999_999));
        assert_eq!(opts.limit, DEFAULT_RESULT_LIMIT);
        let opts = FindOptions::default().with_limit(Some(0));
        assert_eq!(opts.limit, 1);
        let opts = FindOptions::default().with_limit(None);
        assert_eq!(opts.limit, DEFAULT_RESULT_LIMIT);
    }
}
