//! Relationship ledger
//!
//! The only writer of the denormalized relationship counters. Every
//! operation is one `BEGIN IMMEDIATE` unit: edge changes and their
//! counter changes commit together or not at all.
//!
//! Callers are expected to have rejected self-relationships and obvious
//! duplicates already; the ledger itself is idempotent and reports
//! whether anything changed.

use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqliteConnection;

use super::Database;
use crate::error::AppError;

/// Result of [`RelationshipLedger::follow`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    /// Edge inserted and both counters moved
    Created,
    /// Edge was already present; nothing changed
    AlreadyFollowing,
    /// A block exists in either direction; nothing changed
    Blocked,
}

impl FollowOutcome {
    pub fn is_created(self) -> bool {
        self == FollowOutcome::Created
    }
}

/// Atomic follow/block/like state transitions
#[derive(Clone)]
pub struct RelationshipLedger {
    db: Arc<Database>,
}

impl RelationshipLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// `follower_id` starts following `followee_id`
    ///
    /// The block check runs inside the same unit as the insert, so a block
    /// committed concurrently can never end up next to a new follow edge.
    pub async fn follow(
        &self,
        followee_id: i64,
        follower_id: i64,
    ) -> Result<FollowOutcome, AppError> {
        let outcome = self
            .db
            .in_immediate_transaction(move |conn| {
                Box::pin(insert_following(conn, followee_id, follower_id))
            })
            .await?;

        tracing::debug!(followee_id, follower_id, ?outcome, "Ledger follow");
        Ok(outcome)
    }

    /// Remove the follow edge; returns `false` when there was none
    pub async fn unfollow(&self, followee_id: i64, follower_id: i64) -> Result<bool, AppError> {
        let removed = self
            .db
            .in_immediate_transaction(move |conn| {
                Box::pin(delete_following(conn, followee_id, follower_id))
            })
            .await?;

        tracing::debug!(followee_id, follower_id, removed, "Ledger unfollow");
        Ok(removed)
    }

    /// `blocker_id` blocks `blockee_id`
    ///
    /// Follow edges in both directions between the two accounts are removed
    /// in the same unit. Returns `false` when the block already existed.
    pub async fn block(&self, blocker_id: i64, blockee_id: i64) -> Result<bool, AppError> {
        let created = self
            .db
            .in_immediate_transaction(move |conn| {
                Box::pin(insert_blocking(conn, blockee_id, blocker_id))
            })
            .await?;

        tracing::debug!(blocker_id, blockee_id, created, "Ledger block");
        Ok(created)
    }

    /// Remove the block edge only; follows are not restored
    pub async fn unblock(&self, blocker_id: i64, blockee_id: i64) -> Result<bool, AppError> {
        let removed = self
            .db
            .in_immediate_transaction(move |conn| {
                Box::pin(delete_blocking(conn, blockee_id, blocker_id))
            })
            .await?;

        tracing::debug!(blocker_id, blockee_id, removed, "Ledger unblock");
        Ok(removed)
    }

    /// Record a like and bump the post's `like_count`
    pub async fn like(&self, post_id: i64, liked_by_id: i64) -> Result<bool, AppError> {
        self.db
            .in_immediate_transaction(move |conn| Box::pin(insert_like(conn, post_id, liked_by_id)))
            .await
    }

    /// Remove a like and decrement the post's `like_count`
    pub async fn unlike(&self, post_id: i64, liked_by_id: i64) -> Result<bool, AppError> {
        self.db
            .in_immediate_transaction(move |conn| Box::pin(delete_like(conn, post_id, liked_by_id)))
            .await
    }
}

async fn insert_following(
    conn: &mut SqliteConnection,
    followee_id: i64,
    follower_id: i64,
) -> Result<FollowOutcome, AppError> {
    let blocked = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM blockings
        WHERE (blockee_id = ? AND blocker_id = ?)
           OR (blockee_id = ? AND blocker_id = ?)
        "#,
    )
    .bind(followee_id)
    .bind(follower_id)
    .bind(follower_id)
    .bind(followee_id)
    .fetch_one(&mut *conn)
    .await?;
    if blocked > 0 {
        return Ok(FollowOutcome::Blocked);
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO followings (followee_id, follower_id, created_at)
        VALUES (?, ?, ?)
        ON CONFLICT (followee_id, follower_id) DO NOTHING
        "#,
    )
    .bind(followee_id)
    .bind(follower_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() == 0 {
        return Ok(FollowOutcome::AlreadyFollowing);
    }

    bump(
        conn,
        "UPDATE accounts SET follower_count = follower_count + 1 WHERE id = ?",
        followee_id,
    )
    .await?;
    bump(
        conn,
        "UPDATE accounts SET followee_count = followee_count + 1 WHERE id = ?",
        follower_id,
    )
    .await?;

    Ok(FollowOutcome::Created)
}

async fn delete_following(
    conn: &mut SqliteConnection,
    followee_id: i64,
    follower_id: i64,
) -> Result<bool, AppError> {
    let deleted = sqlx::query("DELETE FROM followings WHERE followee_id = ? AND follower_id = ?")
        .bind(followee_id)
        .bind(follower_id)
        .execute(&mut *conn)
        .await?;

    if deleted.rows_affected() == 0 {
        return Ok(false);
    }

    bump(
        conn,
        "UPDATE accounts SET follower_count = follower_count - 1 WHERE id = ?",
        followee_id,
    )
    .await?;
    bump(
        conn,
        "UPDATE accounts SET followee_count = followee_count - 1 WHERE id = ?",
        follower_id,
    )
    .await?;

    Ok(true)
}

async fn insert_blocking(
    conn: &mut SqliteConnection,
    blockee_id: i64,
    blocker_id: i64,
) -> Result<bool, AppError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO blockings (blockee_id, blocker_id, created_at)
        VALUES (?, ?, ?)
        ON CONFLICT (blockee_id, blocker_id) DO NOTHING
        "#,
    )
    .bind(blockee_id)
    .bind(blocker_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() == 0 {
        return Ok(false);
    }

    delete_following(conn, blockee_id, blocker_id).await?;
    delete_following(conn, blocker_id, blockee_id).await?;

    Ok(true)
}

async fn delete_blocking(
    conn: &mut SqliteConnection,
    blockee_id: i64,
    blocker_id: i64,
) -> Result<bool, AppError> {
    let deleted = sqlx::query("DELETE FROM blockings WHERE blockee_id = ? AND blocker_id = ?")
        .bind(blockee_id)
        .bind(blocker_id)
        .execute(&mut *conn)
        .await?;

    Ok(deleted.rows_affected() == 1)
}

async fn insert_like(
    conn: &mut SqliteConnection,
    post_id: i64,
    liked_by_id: i64,
) -> Result<bool, AppError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO likes (post_id, liked_by_id, created_at)
        VALUES (?, ?, ?)
        ON CONFLICT (post_id, liked_by_id) DO NOTHING
        "#,
    )
    .bind(post_id)
    .bind(liked_by_id)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() == 0 {
        return Ok(false);
    }

    bump(conn, "UPDATE posts SET like_count = like_count + 1 WHERE id = ?", post_id).await?;
    Ok(true)
}

async fn delete_like(
    conn: &mut SqliteConnection,
    post_id: i64,
    liked_by_id: i64,
) -> Result<bool, AppError> {
    let deleted = sqlx::query("DELETE FROM likes WHERE post_id = ? AND liked_by_id = ?")
        .bind(post_id)
        .bind(liked_by_id)
        .execute(&mut *conn)
        .await?;

    if deleted.rows_affected() == 0 {
        return Ok(false);
    }

    bump(conn, "UPDATE posts SET like_count = like_count - 1 WHERE id = ?", post_id).await?;
    Ok(true)
}

/// Apply a single-row counter update; a missing row aborts the unit
async fn bump(conn: &mut SqliteConnection, statement: &str, id: i64) -> Result<(), AppError> {
    let updated = sqlx::query(statement).bind(id).execute(&mut *conn).await?;
    if updated.rows_affected() != 1 {
        return Err(AppError::NotFound);
    }
    Ok(())
}
