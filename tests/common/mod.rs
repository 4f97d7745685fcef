//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use fedinode::federation::keys::decode_private_key;
use fedinode::federation::signature::http_date_now;
use fedinode::federation::{ACTIVITY_JSON, generate_digest, generate_key_pair, sign};
use fedinode::{AppState, config};
use http::HeaderValue;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Username bootstrapped on every test server
pub const LOCAL_USERNAME: &str = "alice";

/// Small keys keep key generation fast in debug builds.
const TEST_KEY_BITS: usize = 1024;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server with one local account
    pub async fn new() -> Self {
        Self::with_federation(|_| {}).await
    }

    /// Create a test server, adjusting federation settings first
    pub async fn with_federation(configure: impl FnOnce(&mut config::FederationConfig)) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first so apids can carry the real port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut federation = config::FederationConfig {
            allow_private_hosts: true,
            key_bits: TEST_KEY_BITS,
            ..config::FederationConfig::default()
        };
        configure(&mut federation);

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            federation,
            accounts: config::AccountsConfig {
                bootstrap: vec![LOCAL_USERNAME.to_string()],
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let app = fedinode::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Public authority (`host:port`) of this server
    pub fn domain(&self) -> &str {
        &self.state.config.server.domain
    }

    pub fn local_apid(&self) -> String {
        self.url(&format!("/accounts/{}", LOCAL_USERNAME))
    }

    pub fn local_inbox_path(&self) -> String {
        format!("/accounts/{}/inbox", LOCAL_USERNAME)
    }

    pub async fn local_account(&self) -> fedinode::data::Account {
        self.state
            .db
            .get_local_account(LOCAL_USERNAME)
            .await
            .unwrap()
            .unwrap()
    }

    /// POST `body` to `path` with the given extra headers
    pub async fn post_raw(&self, path: &str, headers: HeaderMap, body: Vec<u8>) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .headers(headers)
            .body(body)
            .send()
            .await
            .unwrap()
    }

    /// POST `activity` to `path`, signed by `signer`
    pub async fn post_signed(
        &self,
        path: &str,
        activity: &Value,
        signer: &RemoteActor,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let headers = signer.signed_headers("POST", path, &body);
        self.post_raw(path, headers, body).await
    }
}

/// Request captured by a remote inbox
#[derive(Debug, Clone)]
pub struct Received {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Received {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

#[derive(Clone)]
struct RemoteState {
    document: Arc<Value>,
    received: Arc<Mutex<Vec<Received>>>,
}

async fn serve_actor(State(state): State<RemoteState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        axum::Json(state.document.as_ref().clone()),
    )
}

async fn capture_inbox(
    State(state): State<RemoteState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.received.lock().await.push(Received {
        path: uri.path().to_string(),
        headers,
        body,
    });
    StatusCode::ACCEPTED
}

/// A fake remote server hosting one actor and its inbox
pub struct RemoteActor {
    pub username: String,
    pub apid: String,
    pub inbox_url: String,
    pub key_id: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
    received: Arc<Mutex<Vec<Received>>>,
}

impl RemoteActor {
    pub async fn spawn(username: &str) -> Self {
        let keys = generate_key_pair(TEST_KEY_BITS).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let apid = format!("{}/users/{}", base, username);
        let inbox_url = format!("{}/inbox", apid);
        let key_id = format!("{}#main-key", apid);

        let document = json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "id": apid,
            "type": "Person",
            "preferredUsername": username,
            "inbox": inbox_url,
            "publicKey": {
                "id": key_id,
                "owner": apid,
                "publicKeyPem": keys.public_key_pem
            }
        });

        let received = Arc::new(Mutex::new(Vec::new()));
        let state = RemoteState {
            document: Arc::new(document),
            received: received.clone(),
        };
        let app = axum::Router::new()
            .route("/users/:username", get(serve_actor))
            .route("/users/:username/inbox", post(capture_inbox))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            username: username.to_string(),
            apid,
            inbox_url,
            key_id,
            public_key_pem: keys.public_key_pem,
            private_key_pem: keys.private_key_pem,
            received,
        }
    }

    /// Date, Digest, Content-Type and a Signature over
    /// `(request-target) date digest`
    pub fn signed_headers(&self, method: &str, path: &str, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("date", HeaderValue::from_str(&http_date_now()).unwrap());
        headers.insert(
            "digest",
            HeaderValue::from_str(&generate_digest(body)).unwrap(),
        );
        headers.insert("content-type", HeaderValue::from_static(ACTIVITY_JSON));

        let private_key = decode_private_key(&self.private_key_pem).unwrap();
        let signature = sign(
            method,
            path,
            &headers,
            &["(request-target)", "date", "digest"],
            &private_key,
            &self.key_id,
        )
        .unwrap();
        headers.insert("signature", HeaderValue::from_str(&signature).unwrap());
        headers
    }

    pub fn follow(&self, object: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/follows/1", self.apid),
            "type": "Follow",
            "actor": self.apid,
            "object": object
        })
    }

    pub fn undo_follow(&self, object: &str) -> Value {
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/undo/1", self.apid),
            "type": "Undo",
            "actor": self.apid,
            "object": self.follow(object)
        })
    }

    /// Wait until at least `count` requests have reached the inbox
    pub async fn wait_for_inbox(&self, count: usize) -> Vec<Received> {
        for _ in 0..100 {
            let received = self.received.lock().await.clone();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.received.lock().await.clone()
    }

    pub async fn inbox_len(&self) -> usize {
        self.received.lock().await.len()
    }
}
