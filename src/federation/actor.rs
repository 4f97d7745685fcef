//! Remote actor resolution
//!
//! Maps an actor URL to a local `Account` row, fetching and persisting the
//! actor document on first sight.

use std::sync::Arc;

use serde::Deserialize;

use super::fetch::{ActorFetcher, document_url};
use crate::data::{Account, Database, LOCAL_HOST, NewAccount};
use crate::error::AppError;
use crate::metrics::ACTOR_RESOLUTIONS_TOTAL;

/// The subset of an actor document this node stores
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDocument {
    pub id: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub inbox: String,
    pub public_key: ActorPublicKey,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorPublicKey {
    pub public_key_pem: String,
}

impl ActorDocument {
    fn username(&self) -> Option<&str> {
        self.preferred_username
            .as_deref()
            .or(self.name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

/// Resolves actor URLs to accounts, caching remote actors in the database
#[derive(Clone)]
pub struct ActorResolver {
    db: Arc<Database>,
    fetcher: ActorFetcher,
}

impl ActorResolver {
    pub fn new(db: Arc<Database>, fetcher: ActorFetcher) -> Self {
        Self { db, fetcher }
    }

    /// Return the account for `apid`, fetching it if unknown
    ///
    /// Safe to call concurrently for the same unknown actor: a losing
    /// insert falls back to reading the winner's row.
    pub async fn resolve(&self, apid: &str) -> Result<Account, AppError> {
        let apid = document_url(apid);

        if let Some(account) = self.db.get_account_by_apid(apid).await? {
            tracing::debug!(apid = %apid, "Actor resolved from database");
            ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["cached"]).inc();
            return Ok(account);
        }

        let document = self.fetcher.fetch_document(apid).await.inspect_err(|_| {
            ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["failed"]).inc();
        })?;
        let new_account = self.account_from_document(apid, document).inspect_err(|_| {
            ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["failed"]).inc();
        })?;

        match self.db.insert_account(&new_account).await {
            Ok(account) => {
                tracing::info!(
                    apid = %account.apid,
                    host = %account.host,
                    "Remote actor stored"
                );
                ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["fetched"]).inc();
                Ok(account)
            }
            Err(error) if error.is_unique_violation() => {
                tracing::debug!(apid = %apid, "Actor stored concurrently, re-reading");
                ACTOR_RESOLUTIONS_TOTAL.with_label_values(&["cached"]).inc();
                self.db
                    .get_account_by_apid(apid)
                    .await?
                    .ok_or_else(|| {
                        // Same (username, host) under a different apid.
                        AppError::Federation(format!(
                            "actor {} collides with an existing account",
                            apid
                        ))
                    })
            }
            Err(error) => Err(error),
        }
    }

    fn account_from_document(
        &self,
        apid: &str,
        document: serde_json::Value,
    ) -> Result<NewAccount, AppError> {
        let document: ActorDocument = serde_json::from_value(document)
            .map_err(|e| AppError::Federation(format!("Invalid actor document {}: {}", apid, e)))?;

        if document.id != apid {
            return Err(AppError::Federation(format!(
                "Actor document id {} does not match {}",
                document.id, apid
            )));
        }

        let username = document
            .username()
            .ok_or_else(|| AppError::Federation(format!("Actor {} has no username", apid)))?
            .to_string();

        let (_, host) = super::fetch::parse_actor_url(apid, self.fetcher.allow_private_hosts())?;
        if host == LOCAL_HOST {
            return Err(AppError::Federation(format!(
                "Remote actor {} claims the local host",
                apid
            )));
        }

        Ok(NewAccount {
            username,
            host,
            apid: document.id,
            inbox_url: document.inbox,
            public_key_pem: document.public_key.public_key_pem,
            private_key_pem: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn create_test_db() -> (Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"))
            .await
            .unwrap();
        (Arc::new(db), temp_dir)
    }

    /// Serve one actor document, counting fetches
    async fn spawn_actor_server(status: u16) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let actor_id = format!("http://{}/users/carol", addr);
        let hits = Arc::new(AtomicUsize::new(0));

        let document = serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": actor_id,
            "type": "Person",
            "preferredUsername": "carol",
            "inbox": format!("{}/inbox", actor_id),
            "publicKey": {
                "id": format!("{}#main-key", actor_id),
                "owner": actor_id,
                "publicKeyPem": "-----BEGIN PUBLIC KEY-----\nabc\n-----END PUBLIC KEY-----\n"
            }
        });

        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/users/carol",
            axum::routing::get(move || {
                let document = document.clone();
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let status = axum::http::StatusCode::from_u16(status).unwrap();
                    (status, axum::Json(document))
                }
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (actor_id, hits)
    }

    fn resolver(db: Arc<Database>) -> ActorResolver {
        let fetcher = ActorFetcher::new(Arc::new(reqwest::Client::new()), true);
        ActorResolver::new(db, fetcher)
    }

    #[tokio::test]
    async fn resolve_fetches_once_then_uses_database() {
        let (db, _temp_dir) = create_test_db().await;
        let (actor_id, hits) = spawn_actor_server(200).await;
        let resolver = resolver(db.clone());

        let first = resolver.resolve(&actor_id).await.unwrap();
        assert_eq!(first.username, "carol");
        assert_eq!(first.host, "127.0.0.1");
        assert_eq!(first.inbox_url, format!("{}/inbox", actor_id));
        assert!(first.private_key_pem.is_none());

        let second = resolver
            .resolve(&format!("{}#main-key", actor_id))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_resolution_creates_one_row() {
        let (db, _temp_dir) = create_test_db().await;
        let (actor_id, _hits) = spawn_actor_server(200).await;
        let resolver = resolver(db.clone());

        let (a, b) = tokio::join!(resolver.resolve(&actor_id), resolver.resolve(&actor_id));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.id, b.id);
        assert_eq!(db.count_accounts().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn error_status_is_a_resolution_failure() {
        let (db, _temp_dir) = create_test_db().await;
        let (actor_id, _hits) = spawn_actor_server(410).await;

        let result = resolver(db.clone()).resolve(&actor_id).await;

        assert!(matches!(result, Err(AppError::Federation(_))));
        assert_eq!(db.count_accounts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn private_hosts_are_refused_by_default() {
        let (db, _temp_dir) = create_test_db().await;
        let (actor_id, hits) = spawn_actor_server(200).await;
        let fetcher = ActorFetcher::new(Arc::new(reqwest::Client::new()), false);

        let result = ActorResolver::new(db, fetcher).resolve(&actor_id).await;

        assert!(result.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn username_falls_back_to_name() {
        let document: ActorDocument = serde_json::from_value(serde_json::json!({
            "id": "https://remote.example/users/1",
            "name": "dave",
            "inbox": "https://remote.example/users/1/inbox",
            "publicKey": {"publicKeyPem": "pem"}
        }))
        .unwrap();

        assert_eq!(document.username(), Some("dave"));
    }
}
