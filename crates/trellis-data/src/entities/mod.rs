// Concrete entity accessors.
//
// Global scope: project, user, session, role.
// Project scope: story, statistics, listing.

pub mod listing;
pub mod project;
pub mod role;
pub mod session;
pub mod statistics;
pub mod story;
pub mod user;
