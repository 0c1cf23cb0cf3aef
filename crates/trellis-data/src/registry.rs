//! Central accessor registry.
//!
//! Built once at startup, immutable afterwards. Accessors that need
//! another entity's operations receive the registry as a call argument
//! (dependency injection at the call site) instead of importing each other,
//! which keeps the entity modules cycle-free.

use crate::accessor::Accessor;
use crate::descriptor::Scope;
use crate::entities;
use std::collections::HashMap;
use std::sync::Arc;
use trellis_commons::{DataError, Result, TableName};

pub struct AccessorRegistry {
    ordered: Vec<Arc<dyn Accessor>>,
    by_table: HashMap<String, Arc<dyn Accessor>>,
}

impl AccessorRegistry {
    /// Registry with the standard entity set, in dependency order (DDL for
    /// earlier entries runs first).
    pub fn standard() -> Self {
        Self::with_accessors(vec![
            Arc::new(entities::project::ProjectAccessor::new()),
            Arc::new(entities::user::UserAccessor::new()),
            Arc::new(entities::session::SessionAccessor::new()),
            Arc::new(entities::role::RoleAccessor::new()),
            Arc::new(entities::story::StoryAccessor::new()),
            Arc::new(entities::statistics::StatisticsAccessor::new()),
            Arc::new(entities::listing::ListingAccessor::new()),
        ])
    }

    pub fn with_accessors(ordered: Vec<Arc<dyn Accessor>>) -> Self {
        let by_table = ordered
            .iter()
            .map(|a| (a.table().as_str().to_string(), Arc::clone(a)))
            .collect();
        AccessorRegistry { ordered, by_table }
    }

    pub fn get(&self, table: &str) -> Result<Arc<dyn Accessor>> {
        self.by_table
            .get(table)
            .cloned()
            .ok_or_else(|| DataError::table_not_found(table))
    }

    /// Accessor for a table within a namespace class; a global-scope table
    /// requested against a project namespace (or vice versa) is unknown.
    pub fn get_scoped(&self, table: &str, scope: Scope) -> Result<Arc<dyn Accessor>> {
        let accessor = self.get(table)?;
        if accessor.scope() != scope {
            return Err(DataError::table_not_found(table));
        }
        Ok(accessor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Accessor>> {
        self.ordered.iter()
    }

    pub fn for_scope(&self, scope: Scope) -> impl Iterator<Item = &Arc<dyn Accessor>> {
        self.ordered.iter().filter(move |a| a.scope() == scope)
    }

    /// Highest version declared by any accessor of the scope; namespaces
    /// upgrade toward this.
    pub fn max_version(&self, scope: Scope) -> i32 {
        self.for_scope(scope)
            .map(|a| a.version())
            .max()
            .unwrap_or(1)
    }

    pub fn tables(&self) -> Vec<TableName> {
        self.ordered.iter().map(|a| a.table()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // `unwrap_err` in the tests needs the Ok type to be Debug.
    impl std::fmt::Debug for dyn Accessor {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.table().as_str())
        }
    }

    #[test]
    fn test_standard_registry_lookup() {
        let registry = AccessorRegistry::standard();
        assert!(registry.get("story").is_ok());
        assert!(registry.get("project").is_ok());
        let err = registry.get("widget").unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_scope_mismatch_is_not_found() {
        let registry = AccessorRegistry::standard();
        assert!(registry.get_scoped("story", Scope::Project).is_ok());
        assert!(registry.get_scoped("story", Scope::Global).is_err());
        assert!(registry.get_scoped("project", Scope::Global).is_ok());
        assert!(registry.get_scoped("project", Scope::Project).is_err());
    }

    #[test]
    fn test_max_version_per_scope() {
        let registry = AccessorRegistry::standard();
        // story declares version 2; the global scope is still at 1
        assert_eq!(registry.max_version(Scope::Project), 2);
        assert_eq!(registry.max_version(Scope::Global), 1);
    }
}
