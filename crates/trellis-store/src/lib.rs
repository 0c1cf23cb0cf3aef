// Trellis Store
//
// PostgreSQL plumbing shared by every component: connection pool
// management, the generic change-notification trigger function, and the
// overflow queue for notifications too large for NOTIFY payloads.

pub mod db;
pub mod notify;
pub mod queue;

pub use db::{Database, DatabaseConfig};
pub use notify::{change_channel, sync_channel, SCHEMA_EVENT_CHANNEL};
