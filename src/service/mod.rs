//! Service layer
//!
//! Contains business logic separated from HTTP handlers.
//! Services orchestrate the database, the relationship ledger and
//! federation delivery.

mod account;
mod post;
mod relationship;

pub use account::AccountService;
pub use post::PostService;
pub use relationship::RelationshipService;
