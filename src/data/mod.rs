//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Relationship ledger (atomic edge + counter updates)

mod database;
mod ledger;
mod models;

pub use database::Database;
pub use ledger::{FollowOutcome, RelationshipLedger};
pub use models::*;
