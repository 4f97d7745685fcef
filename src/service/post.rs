//! Post service
//!
//! Creates posts, replies and reposts. Plain posts are announced to
//! remote followers as `Create{Note}`.

use std::sync::Arc;

use crate::data::{Account, Database, NewPost, Post};
use crate::error::AppError;
use crate::federation::ActivityDelivery;
use crate::federation::activity::create_note;

/// Post service
#[derive(Clone)]
pub struct PostService {
    db: Arc<Database>,
    delivery: ActivityDelivery,
    base_url: String,
}

impl PostService {
    pub fn new(db: Arc<Database>, delivery: ActivityDelivery, base_url: String) -> Self {
        Self {
            db,
            delivery,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Create a post authored by a local account
    ///
    /// Reply and repost counters on the parent move with the insert. A
    /// plain post is handed to the delivery dispatcher for every remote
    /// follower inbox without waiting for the outcome.
    ///
    /// # Errors
    /// `Validation` when content is missing (and this is not a repost),
    /// when the parent post is unknown, or when `author` is not local
    pub async fn create_post(&self, author: &Account, post: NewPost) -> Result<Post, AppError> {
        if !author.is_local() {
            return Err(AppError::Validation(
                "only local accounts can author posts".to_string(),
            ));
        }

        let content = post
            .content
            .as_deref()
            .map(str::trim)
            .filter(|content| !content.is_empty());
        if content.is_none() && post.repost_to_id.is_none() {
            return Err(AppError::Validation("content is required".to_string()));
        }

        let created = self.db.insert_post(author.id, &post).await?;
        tracing::info!(
            post_id = created.id,
            author = %author.username,
            reply_to_id = ?created.reply_to_id,
            repost_to_id = ?created.repost_to_id,
            "Post created"
        );

        if created.reply_to_id.is_none() && created.repost_to_id.is_none() {
            self.announce(author, &created).await?;
        }

        Ok(created)
    }

    async fn announce(&self, author: &Account, post: &Post) -> Result<(), AppError> {
        let inboxes: Vec<String> = self
            .db
            .list_remote_followers(author.id)
            .await?
            .into_iter()
            .map(|follower| follower.inbox_url)
            .collect();

        if inboxes.is_empty() {
            return Ok(());
        }

        let activity = create_note(&self.base_url, author, post);
        self.delivery
            .spawn_to_inboxes(activity, author.clone(), inboxes);
        Ok(())
    }
}
