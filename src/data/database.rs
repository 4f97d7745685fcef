//! SQLite database operations
//!
//! All database access goes through this module or the relationship
//! ledger, which shares the same pool.

use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;

use super::models::*;
use crate::error::AppError;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    /// Run `work` inside `BEGIN IMMEDIATE ... COMMIT` on one connection.
    ///
    /// The write lock is taken up front, so concurrent units queue on the
    /// busy timeout instead of failing on a lock upgrade. Any error rolls
    /// the whole unit back.
    ///
    /// The unit runs on its own task. Dropping the returned future does not
    /// stop it, so a connection never goes back to the pool with the
    /// transaction still open.
    pub(crate) async fn in_immediate_transaction<T, F>(&self, work: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T, AppError>>
            + Send
            + 'static,
    {
        let pool = self.pool.clone();
        let unit = tokio::spawn(async move {
            let mut conn = pool.acquire().await?;
            sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

            let result = match work(&mut *conn).await {
                Ok(value) => sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map(|_| value)
                    .map_err(AppError::from),
                Err(error) => Err(error),
            };

            if result.is_err() {
                if let Err(error) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::warn!(%error, "Rollback failed, discarding connection");
                    drop(conn.detach());
                }
            }
            result
        });

        unit.await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Transaction task failed: {}", e)))?
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Insert a new account row
    ///
    /// Uniqueness of `apid` and `(username, host)` is enforced by the
    /// schema; a violation surfaces as `AppError::Database` and can be
    /// detected with [`AppError::is_unique_violation`].
    pub async fn insert_account(&self, account: &NewAccount) -> Result<Account, AppError> {
        let now = Utc::now();
        let inserted = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (
                username, host, apid, inbox_url, public_key_pem, private_key_pem,
                follower_count, followee_count, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&account.username)
        .bind(&account.host)
        .bind(&account.apid)
        .bind(&account.inbox_url)
        .bind(&account.public_key_pem)
        .bind(&account.private_key_pem)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    /// Look up an account by its federation identifier
    pub async fn get_account_by_apid(&self, apid: &str) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE apid = ?")
            .bind(apid)
            .fetch_optional(&self.pool)
            .await?;

        Ok(account)
    }

    /// Look up a local account by username
    pub async fn get_local_account(&self, username: &str) -> Result<Option<Account>, AppError> {
        let account =
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE username = ? AND host = ?")
                .bind(username)
                .bind(LOCAL_HOST)
                .fetch_optional(&self.pool)
                .await?;

        Ok(account)
    }

    pub async fn count_accounts(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accounts")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Count accounts hosted on this node
    pub async fn count_local_accounts(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM accounts WHERE host = ?")
            .bind(LOCAL_HOST)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Relationships (read side)
    // =========================================================================

    pub async fn get_following(
        &self,
        followee_id: i64,
        follower_id: i64,
    ) -> Result<Option<Following>, AppError> {
        let following = sqlx::query_as::<_, Following>(
            "SELECT * FROM followings WHERE followee_id = ? AND follower_id = ?",
        )
        .bind(followee_id)
        .bind(follower_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(following)
    }

    pub async fn is_following(&self, followee_id: i64, follower_id: i64) -> Result<bool, AppError> {
        Ok(self.get_following(followee_id, follower_id).await?.is_some())
    }

    /// Count follow edges in either direction between two accounts
    pub async fn count_followings_between(&self, a: i64, b: i64) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM followings
            WHERE (followee_id = ? AND follower_id = ?) OR (followee_id = ? AND follower_id = ?)
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn get_blocking(
        &self,
        blockee_id: i64,
        blocker_id: i64,
    ) -> Result<Option<Blocking>, AppError> {
        let blocking = sqlx::query_as::<_, Blocking>(
            "SELECT * FROM blockings WHERE blockee_id = ? AND blocker_id = ?",
        )
        .bind(blockee_id)
        .bind(blocker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(blocking)
    }

    /// True when either account blocks the other
    pub async fn is_blocked_either_way(&self, a: i64, b: i64) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM blockings
            WHERE (blockee_id = ? AND blocker_id = ?) OR (blockee_id = ? AND blocker_id = ?)
            "#,
        )
        .bind(a)
        .bind(b)
        .bind(b)
        .bind(a)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Accounts following `account_id`
    pub async fn list_followers(&self, account_id: i64) -> Result<Vec<Account>, AppError> {
        let followers = sqlx::query_as::<_, Account>(
            r#"
            SELECT a.* FROM followings f
            JOIN accounts a ON a.id = f.follower_id
            WHERE f.followee_id = ?
            ORDER BY f.created_at, a.id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    /// Remote accounts following `account_id` (delivery targets)
    pub async fn list_remote_followers(&self, account_id: i64) -> Result<Vec<Account>, AppError> {
        let followers = sqlx::query_as::<_, Account>(
            r#"
            SELECT a.* FROM followings f
            JOIN accounts a ON a.id = f.follower_id
            WHERE f.followee_id = ? AND a.host <> ?
            ORDER BY f.created_at, a.id
            "#,
        )
        .bind(account_id)
        .bind(LOCAL_HOST)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    // =========================================================================
    // Posts & Likes
    // =========================================================================

    /// Insert a post, bumping the parent's reply or repost counter in the same unit
    pub async fn insert_post(&self, author_id: i64, post: &NewPost) -> Result<Post, AppError> {
        let post = post.clone();
        self.in_immediate_transaction(move |conn| Box::pin(insert_post_row(conn, author_id, post)))
            .await
    }

    pub async fn get_post(&self, id: i64) -> Result<Option<Post>, AppError> {
        let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(post)
    }

    /// Count posts authored by local accounts
    pub async fn count_local_posts(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM posts p
            JOIN accounts a ON a.id = p.author_id
            WHERE a.host = ?
            "#,
        )
        .bind(LOCAL_HOST)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn get_like(&self, post_id: i64, liked_by_id: i64) -> Result<Option<Like>, AppError> {
        let like =
            sqlx::query_as::<_, Like>("SELECT * FROM likes WHERE post_id = ? AND liked_by_id = ?")
                .bind(post_id)
                .bind(liked_by_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(like)
    }
}

async fn bump_parent(
    conn: &mut SqliteConnection,
    statement: &str,
    parent_id: i64,
    missing: &str,
) -> Result<(), AppError> {
    let updated = sqlx::query(statement)
        .bind(parent_id)
        .execute(&mut *conn)
        .await?;
    if updated.rows_affected() != 1 {
        return Err(AppError::Validation(missing.to_string()));
    }
    Ok(())
}

async fn insert_post_row(
    conn: &mut SqliteConnection,
    author_id: i64,
    post: NewPost,
) -> Result<Post, AppError> {
    // A post carrying both ids counts as a reply only.
    if let Some(reply_to_id) = post.reply_to_id {
        bump_parent(
            conn,
            "UPDATE posts SET replies_count = replies_count + 1 WHERE id = ?",
            reply_to_id,
            "the replying post with the given id is not found",
        )
        .await?;
    } else if let Some(repost_to_id) = post.repost_to_id {
        bump_parent(
            conn,
            "UPDATE posts SET repost_count = repost_count + 1 WHERE id = ?",
            repost_to_id,
            "the reposting post with the given id is not found",
        )
        .await?;
    }

    let inserted = sqlx::query_as::<_, Post>(
        r#"
        INSERT INTO posts (
            author_id, content, reply_to_id, repost_to_id,
            like_count, replies_count, repost_count, created_at
        ) VALUES (?, ?, ?, ?, 0, 0, 0, ?)
        RETURNING *
        "#,
    )
    .bind(author_id)
    .bind(&post.content)
    .bind(post.reply_to_id)
    .bind(post.repost_to_id)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;

    Ok(inserted)
}
