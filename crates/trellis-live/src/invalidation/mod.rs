//! Lazy invalidation of derived aggregate rows.
//!
//! Analyser descriptors declare which source-table columns affect each
//! statistic kind; listing descriptors do the same for curated membership
//! sets. The engine diffs incoming change events against those
//! declarations and flips dirty flags — idempotently, in small batches,
//! least-sampled rows first. Recomputation is the next reader's job.

mod descriptors;
mod engine;

pub use descriptors::{
    AnalyserDescriptor, InvalidationRegistry, ListingDescriptor,
};
pub use engine::InvalidationEngine;
