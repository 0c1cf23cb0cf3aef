// Trellis Schema
//
// Tenant namespace lifecycle: provisioning a fresh schema with every
// registered table, trigger and grant in one transaction, renaming and
// retiring schemas as their owning project rows change, rolling structural
// upgrades forward version by version, and the background maintenance task
// that prunes the notification queue and garbage-collects soft-deleted
// rows.

pub mod coordinator;
pub mod maintenance;
pub mod manager;

pub use coordinator::SchemaCoordinator;
pub use maintenance::{MaintenanceConfig, MaintenanceTask};
pub use manager::{SchemaConfig, SchemaManager};
