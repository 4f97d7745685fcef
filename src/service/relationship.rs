//! Relationship service
//!
//! Caller-side checks in front of the relationship ledger: the ledger is
//! idempotent and reports what it did, so self-relationships, unknown
//! targets, duplicates and blocked pairs are turned into validation
//! errors here.

use std::sync::Arc;

use crate::data::{Database, FollowOutcome, RelationshipLedger};
use crate::error::AppError;

/// Follow, block and like operations initiated by a local account
#[derive(Clone)]
pub struct RelationshipService {
    db: Arc<Database>,
    ledger: RelationshipLedger,
}

impl RelationshipService {
    pub fn new(db: Arc<Database>, ledger: RelationshipLedger) -> Self {
        Self { db, ledger }
    }

    async fn ensure_account(&self, id: i64, role: &str) -> Result<(), AppError> {
        match self.db.get_account(id).await? {
            Some(_) => Ok(()),
            None => Err(AppError::Validation(format!(
                "{} with the given id is not found",
                role
            ))),
        }
    }

    /// `follower_id` follows `followee_id`
    ///
    /// # Errors
    /// `Validation` for self-follows, unknown followees, existing edges and
    /// pairs separated by a block in either direction
    pub async fn follow(&self, followee_id: i64, follower_id: i64) -> Result<(), AppError> {
        if followee_id == follower_id {
            return Err(AppError::Validation("cannot follow yourself".to_string()));
        }
        self.ensure_account(followee_id, "followee").await?;

        match self.ledger.follow(followee_id, follower_id).await? {
            FollowOutcome::Created => {}
            FollowOutcome::AlreadyFollowing => {
                return Err(AppError::Validation("already followed".to_string()));
            }
            FollowOutcome::Blocked => {
                return Err(AppError::Validation(
                    "cannot follow a blocked account".to_string(),
                ));
            }
        }

        tracing::info!(followee_id, follower_id, "Account followed");
        Ok(())
    }

    pub async fn unfollow(&self, followee_id: i64, follower_id: i64) -> Result<(), AppError> {
        self.ensure_account(followee_id, "followee").await?;

        if !self.ledger.unfollow(followee_id, follower_id).await? {
            return Err(AppError::Validation("not followed".to_string()));
        }

        tracing::info!(followee_id, follower_id, "Account unfollowed");
        Ok(())
    }

    /// `blocker_id` blocks `blockee_id`, dropping follows both ways
    pub async fn block(&self, blockee_id: i64, blocker_id: i64) -> Result<(), AppError> {
        if blockee_id == blocker_id {
            return Err(AppError::Validation("cannot block yourself".to_string()));
        }
        self.ensure_account(blockee_id, "blockee").await?;

        if !self.ledger.block(blocker_id, blockee_id).await? {
            return Err(AppError::Validation("already blocked".to_string()));
        }

        tracing::info!(blockee_id, blocker_id, "Account blocked");
        Ok(())
    }

    pub async fn unblock(&self, blockee_id: i64, blocker_id: i64) -> Result<(), AppError> {
        self.ensure_account(blockee_id, "blockee").await?;

        if !self.ledger.unblock(blocker_id, blockee_id).await? {
            return Err(AppError::Validation("not blocked".to_string()));
        }

        tracing::info!(blockee_id, blocker_id, "Account unblocked");
        Ok(())
    }

    /// Like a post
    ///
    /// # Errors
    /// `NotFound` for unknown posts, `Validation` when already liked
    pub async fn like(&self, post_id: i64, liked_by_id: i64) -> Result<(), AppError> {
        self.db.get_post(post_id).await?.ok_or(AppError::NotFound)?;

        if !self.ledger.like(post_id, liked_by_id).await? {
            return Err(AppError::Validation("already liked".to_string()));
        }
        Ok(())
    }

    pub async fn unlike(&self, post_id: i64, liked_by_id: i64) -> Result<(), AppError> {
        self.db.get_post(post_id).await?.ok_or(AppError::NotFound)?;

        if !self.ledger.unlike(post_id, liked_by_id).await? {
            return Err(AppError::Validation("not liked".to_string()));
        }
        Ok(())
    }
}
