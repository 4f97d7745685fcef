//! Outbound actor document fetches
//!
//! Both the key lookup during signature verification and the actor
//! resolver go through [`ActorFetcher`], which refuses loopback and
//! private destinations unless explicitly allowed.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

pub const ACTIVITY_JSON: &str = "application/activity+json";

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Federation(format!(
                "Actor host {} resolves to a private address",
                host
            )));
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// Strip the `#fragment` from a key id or actor URL
pub fn document_url(actor_or_key_id: &str) -> &str {
    actor_or_key_id
        .split('#')
        .next()
        .unwrap_or(actor_or_key_id)
}

/// Parse and vet an actor URL, returning it with its host
///
/// Rejects non-HTTP(S) URLs, and loopback/private hosts unless
/// `allow_private_hosts` is set.
pub fn parse_actor_url(
    actor_or_key_id: &str,
    allow_private_hosts: bool,
) -> Result<(url::Url, String), AppError> {
    let parsed = url::Url::parse(document_url(actor_or_key_id))
        .map_err(|e| AppError::Federation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Federation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Federation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if !allow_private_hosts && is_disallowed_host(&host) {
        return Err(AppError::Federation(format!(
            "Refusing to fetch actor from private host {}",
            host
        )));
    }

    Ok((parsed, host))
}

/// Anonymous GET of remote actor documents
#[derive(Clone)]
pub struct ActorFetcher {
    http_client: Arc<reqwest::Client>,
    allow_private_hosts: bool,
}

impl ActorFetcher {
    pub fn new(http_client: Arc<reqwest::Client>, allow_private_hosts: bool) -> Self {
        Self {
            http_client,
            allow_private_hosts,
        }
    }

    pub fn allow_private_hosts(&self) -> bool {
        self.allow_private_hosts
    }

    /// Fetch the actor document behind `actor_or_key_id`
    ///
    /// Any fragment is stripped first. Network failures, timeouts and
    /// non-2xx responses all come back as `AppError::Federation`.
    pub async fn fetch_document(&self, actor_or_key_id: &str) -> Result<serde_json::Value, AppError> {
        let (url, host) = parse_actor_url(actor_or_key_id, self.allow_private_hosts)?;

        if !self.allow_private_hosts {
            let port = url
                .port_or_known_default()
                .ok_or_else(|| AppError::Federation("Missing port in actor URL".to_string()))?;
            // Catch public-looking names that resolve to internal addresses.
            validate_resolved_host_ips(&host, port).await?;
        }

        let started = Instant::now();
        let result = self
            .http_client
            .get(url.as_str())
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .send()
            .await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());

        let response = result.map_err(|e| {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["outbound", "error"])
                .inc();
            AppError::Federation(format!("Failed to fetch actor {}: {}", url, e))
        })?;

        if !response.status().is_success() {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["outbound", "rejected"])
                .inc();
            return Err(AppError::Federation(format!(
                "Failed to fetch actor {}: HTTP {}",
                url,
                response.status()
            )));
        }

        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", "success"])
            .inc();

        response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse actor {}: {}", url, e)))
    }
}
