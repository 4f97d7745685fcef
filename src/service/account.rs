//! Account service
//!
//! Creates local accounts with fresh key material.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::data::{Account, Database, LOCAL_HOST, NewAccount};
use crate::error::AppError;
use crate::federation::generate_key_pair;

fn validate_username(username: &str) -> Result<(), AppError> {
    if username.is_empty() {
        return Err(AppError::Validation("username cannot be empty".to_string()));
    }

    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AppError::Validation(
            "username may only contain letters, digits and underscores".to_string(),
        ));
    }

    Ok(())
}

/// Account service
#[derive(Clone)]
pub struct AccountService {
    db: Arc<Database>,
    server: ServerConfig,
    key_bits: usize,
}

impl AccountService {
    /// Create new account service
    pub fn new(db: Arc<Database>, server: ServerConfig, key_bits: usize) -> Self {
        Self {
            db,
            server,
            key_bits,
        }
    }

    /// Get a local account by username
    pub async fn get_local_account(&self, username: &str) -> Result<Account, AppError> {
        self.db
            .get_local_account(username)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Create a local account
    ///
    /// # Errors
    /// Returns `Validation` for malformed or already taken usernames
    pub async fn create_local_account(&self, username: &str) -> Result<Account, AppError> {
        let username = username.trim();
        validate_username(username)?;

        // Fast-path guard before expensive key generation.
        if self.db.get_local_account(username).await?.is_some() {
            return Err(AppError::Validation(
                "username is already taken".to_string(),
            ));
        }

        let keys = generate_key_pair(self.key_bits).await?;
        let apid = self.server.account_apid(username);

        let new_account = NewAccount {
            username: username.to_string(),
            host: LOCAL_HOST.to_string(),
            inbox_url: format!("{}/inbox", apid),
            apid,
            public_key_pem: keys.public_key_pem,
            private_key_pem: Some(keys.private_key_pem),
        };

        let account = self.db.insert_account(&new_account).await.map_err(|error| {
            if error.is_unique_violation() {
                AppError::Validation("username is already taken".to_string())
            } else {
                error
            }
        })?;

        tracing::info!(
            username = %account.username,
            apid = %account.apid,
            "Local account created"
        );

        Ok(account)
    }

    /// Return the local account, creating it when missing
    pub async fn ensure_local_account(&self, username: &str) -> Result<Account, AppError> {
        if let Some(account) = self.db.get_local_account(username.trim()).await? {
            tracing::info!(username = %account.username, "Local account exists");
            return Ok(account);
        }

        match self.create_local_account(username).await {
            Ok(account) => Ok(account),
            Err(AppError::Validation(message)) => {
                // Lost a race against another creator.
                match self.db.get_local_account(username.trim()).await? {
                    Some(account) => Ok(account),
                    None => Err(AppError::Validation(message)),
                }
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_service() -> (AccountService, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 3000,
            domain: "localhost:3000".to_string(),
            protocol: "http".to_string(),
        };
        (AccountService::new(db.clone(), server, 1024), db, temp_dir)
    }

    #[tokio::test]
    async fn create_local_account_sets_federation_fields() {
        let (service, _db, _temp_dir) = create_service().await;

        let account = service.create_local_account("alice").await.unwrap();

        assert_eq!(account.host, "localhost");
        assert_eq!(account.apid, "http://localhost:3000/accounts/alice");
        assert_eq!(account.inbox_url, "http://localhost:3000/accounts/alice/inbox");
        assert!(account.public_key_pem.contains("BEGIN PUBLIC KEY"));
        assert!(account.private_key_pem.is_some());
    }

    #[tokio::test]
    async fn create_local_account_rejects_bad_usernames() {
        let (service, _db, _temp_dir) = create_service().await;

        for username in ["", "   ", "with space", "dash-name", "émile"] {
            assert!(
                matches!(
                    service.create_local_account(username).await,
                    Err(AppError::Validation(_))
                ),
                "{username:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn create_local_account_rejects_duplicates() {
        let (service, db, _temp_dir) = create_service().await;

        service.create_local_account("alice").await.unwrap();
        let error = service.create_local_account("alice").await.unwrap_err();

        assert!(matches!(error, AppError::Validation(_)));
        assert_eq!(db.count_accounts().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ensure_local_account_is_idempotent() {
        let (service, db, _temp_dir) = create_service().await;

        let first = service.ensure_local_account("alice").await.unwrap();
        let second = service.ensure_local_account("alice").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(db.count_accounts().await.unwrap(), 1);
    }
}
