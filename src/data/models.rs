//! Data models
//!
//! Rust structs representing database entities.
//! Rows use SQLite integer ids and chrono timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Host value stored for accounts that live on this node.
pub const LOCAL_HOST: &str = "localhost";

// =============================================================================
// Account
// =============================================================================

/// A local or remote actor
///
/// `(username, host)` and `apid` are unique. Local accounts always carry
/// both keys; remote accounts never carry a private key.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub username: String,
    /// `"localhost"` for local accounts, otherwise the remote hostname
    pub host: String,
    /// Federation identifier (stable actor URL)
    pub apid: String,
    pub inbox_url: String,
    /// RSA public key (SPKI PEM)
    pub public_key_pem: String,
    /// RSA private key (PEM), local accounts only
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub follower_count: i64,
    pub followee_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn is_local(&self) -> bool {
        self.host == LOCAL_HOST
    }

    /// `keyId` advertised for this account's public key
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.apid)
    }
}

/// Account row to insert
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub host: String,
    pub apid: String,
    pub inbox_url: String,
    pub public_key_pem: String,
    pub private_key_pem: Option<String>,
}

// =============================================================================
// Relationships
// =============================================================================

/// Directed follow edge: `follower_id` follows `followee_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Following {
    pub followee_id: i64,
    pub follower_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Directed block edge: `blocker_id` blocks `blockee_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Blocking {
    pub blockee_id: i64,
    pub blocker_id: i64,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Posts & Likes
// =============================================================================

/// A post, reply, or repost
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub author_id: i64,
    /// Absent only for plain reposts
    pub content: Option<String>,
    pub reply_to_id: Option<i64>,
    pub repost_to_id: Option<i64>,
    pub like_count: i64,
    pub replies_count: i64,
    pub repost_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Post fields supplied by the author
#[derive(Debug, Clone, Default)]
pub struct NewPost {
    pub content: Option<String>,
    pub reply_to_id: Option<i64>,
    pub repost_to_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Like {
    pub post_id: i64,
    pub liked_by_id: i64,
    pub created_at: DateTime<Utc>,
}
