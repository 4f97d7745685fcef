//! fedinode - a small federated social-networking node
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Actor documents and inboxes                              │
//! │  - WebFinger / NodeInfo discovery                           │
//! │  - Metrics                                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │             Service & Federation Layer                       │
//! │  - Signature/digest verification, actor resolution          │
//! │  - Inbox dispatch, signed delivery                          │
//! │  - Account, relationship and post services                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! │  - Relationship ledger (atomic counters)                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Largest inbox body accepted.
const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// Cloned for each request; every member is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub db: Arc<data::Database>,
    /// HTTP client for federation (actor fetches and deliveries)
    pub http_client: Arc<reqwest::Client>,
    pub ledger: data::RelationshipLedger,
    pub resolver: federation::ActorResolver,
    pub delivery: federation::ActivityDelivery,
    pub inbox: federation::InboxDispatcher,
    pub accounts: service::AccountService,
    pub relationships: service::RelationshipService,
    pub posts: service::PostService,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (runs migrations)
    /// 2. Build the federation HTTP client
    /// 3. Wire federation components and services
    /// 4. Ensure bootstrap local accounts exist
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);

        let http_client = reqwest::Client::builder()
            .user_agent(config.federation.user_agent.clone())
            .timeout(config.federation.request_timeout())
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;
        let http_client = Arc::new(http_client);

        let ledger = data::RelationshipLedger::new(db.clone());
        let fetcher =
            federation::ActorFetcher::new(http_client.clone(), config.federation.allow_private_hosts);
        let resolver = federation::ActorResolver::new(db.clone(), fetcher.clone());
        let delivery = federation::ActivityDelivery::new(http_client.clone());
        let inbox = federation::InboxDispatcher::new(
            db.clone(),
            ledger.clone(),
            resolver.clone(),
            fetcher,
            delivery.clone(),
            config.federation.clone(),
        );

        let accounts = service::AccountService::new(
            db.clone(),
            config.server.clone(),
            config.federation.key_bits,
        );
        let relationships = service::RelationshipService::new(db.clone(), ledger.clone());
        let posts =
            service::PostService::new(db.clone(), delivery.clone(), config.server.base_url());

        for username in &config.accounts.bootstrap {
            accounts.ensure_local_account(username).await?;
        }

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            ledger,
            resolver,
            delivery,
            inbox,
            accounts,
            relationships,
            posts,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use axum::extract::DefaultBodyLimit;
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(DefaultBodyLimit::max(MAX_INBOX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
