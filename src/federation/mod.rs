//! ActivityPub federation module
//!
//! Handles:
//! - Key material for local accounts
//! - HTTP Signatures and body digests
//! - Remote actor fetching and resolution
//! - Activity delivery (outbox)
//! - Inbound activity dispatch (inbox)

pub mod activity;
mod actor;
mod delivery;
pub mod digest;
mod fetch;
mod inbox;
pub mod keys;
pub mod signature;

pub use activity::InboundActivity;
pub use actor::{ActorDocument, ActorResolver};
pub use delivery::{ActivityDelivery, DeliveryResult};
pub use digest::{generate_digest, verify_digest};
pub use fetch::{ACTIVITY_JSON, ActorFetcher};
pub use inbox::{InboxDispatcher, InboxOutcome};
pub use keys::{KeyPair, generate_key_pair, signing_key_for};
pub use signature::{SignatureError, SignedRequest, sign, verify_request, verify_with_key};
