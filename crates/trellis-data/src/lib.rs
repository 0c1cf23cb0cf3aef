// Trellis Data
//
// The Entity Accessor Contract: every entity type (table) implements the
// same operation set — find, filter, export, import, save, associate,
// sync, clean — plus the DDL hooks the schema lifecycle manager drives
// (create, grant, watch, upgrade). Shared behavior lives in default trait
// method bodies; entities override only the hooks they specialize.

pub mod accessor;
pub mod credentials;
pub mod descriptor;
pub mod entities;
pub mod registry;
pub mod sql;

pub use accessor::Accessor;
pub use credentials::{Access, Credentials};
pub use descriptor::{
    ColumnDef, ColumnKind, ColumnSelection, ExportOptions, FindOptions, Scope,
    DEFAULT_RESULT_LIMIT,
};
pub use registry::AccessorRegistry;
