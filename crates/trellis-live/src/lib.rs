// Trellis Live
//
// The change-notification pipeline: a router subscribed to the store's
// per-table notification channels fans batches of row-change events out to
// consumers, and the invalidation engine consumes them to mark derived
// statistics and listing rows dirty. Nothing here recomputes aggregates;
// readers do that lazily.

pub mod event;
pub mod invalidation;
pub mod router;

pub use event::{ChangeEvent, ChangeOp};
pub use invalidation::{InvalidationEngine, InvalidationRegistry};
pub use router::{ChangeConsumer, NotificationRouter};
