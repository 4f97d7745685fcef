//! Activity delivery
//!
//! Signs and POSTs activities to remote inboxes. There is no retry queue:
//! a failed delivery is logged and counted, then dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use http::{HeaderMap, HeaderValue, header};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::digest::generate_digest;
use super::fetch::ACTIVITY_JSON;
use super::keys::signing_key_for;
use super::signature::{OUTBOUND_SIGNED_HEADERS, http_date_now, sign};
use crate::data::Account;
use crate::error::AppError;
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_SENT, FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
};

/// Upper bound on simultaneous POSTs during a fan-out.
const MAX_CONCURRENT_DELIVERIES: usize = 10;

/// Outcome of one delivery in a fan-out
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub inbox_url: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Activity delivery service
///
/// Sends activities to remote inbox endpoints.
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: Arc<reqwest::Client>,
}

/// Deduplicate identical inbox URLs while keeping distinct personal inboxes.
fn unique_inbox_targets(inbox_urls: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    inbox_urls
        .into_iter()
        .filter(|inbox_url| seen.insert(inbox_url.clone()))
        .collect()
}

fn activity_type(activity: &serde_json::Value) -> &str {
    activity
        .get("type")
        .and_then(|value| value.as_str())
        .unwrap_or("unknown")
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid header value: {}", e)))
}

impl ActivityDelivery {
    pub fn new(http_client: Arc<reqwest::Client>) -> Self {
        Self { http_client }
    }

    /// Deliver activity to a single inbox as `as_account`
    ///
    /// The signature covers `(request-target)` and `date`. A `Digest`
    /// header is sent alongside for receivers that check one.
    ///
    /// # Errors
    /// Returns error if signing fails, the request fails, or the inbox
    /// answers with a non-2xx status
    pub async fn deliver(
        &self,
        activity: &serde_json::Value,
        as_account: &Account,
        inbox_url: &str,
    ) -> Result<(), AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize activity: {}", e)))?;

        let url = url::Url::parse(inbox_url)
            .map_err(|e| AppError::Federation(format!("Invalid inbox URL {}: {}", inbox_url, e)))?;
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let mut headers = HeaderMap::new();
        headers.insert(header::DATE, header_value(&http_date_now())?);
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON));
        headers.insert(header::ACCEPT, HeaderValue::from_static(ACTIVITY_JSON));
        headers.insert("digest", header_value(&generate_digest(&body))?);

        let private_key = signing_key_for(as_account)?;
        let signature = sign(
            "POST",
            &path,
            &headers,
            &OUTBOUND_SIGNED_HEADERS,
            &private_key,
            &as_account.key_id(),
        )
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to sign delivery: {}", e)))?;
        headers.insert("signature", header_value(&signature)?);

        let started = Instant::now();
        let result = self
            .http_client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["delivery"])
            .observe(started.elapsed().as_secs_f64());

        let response = result.map_err(|e| {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["delivery", "error"])
                .inc();
            AppError::Federation(format!("Failed to deliver to {}: {}", inbox_url, e))
        })?;

        if !response.status().is_success() {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["delivery", "rejected"])
                .inc();
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox_url,
                response.status()
            )));
        }

        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["delivery", "success"])
            .inc();
        tracing::info!(
            inbox = %inbox_url,
            activity_type = %activity_type(activity),
            "Delivered activity"
        );
        Ok(())
    }

    /// Deliver in the background; the caller does not wait for the result
    pub fn spawn_delivery(
        &self,
        activity: serde_json::Value,
        as_account: Account,
        inbox_url: String,
    ) -> JoinHandle<()> {
        let delivery = self.clone();
        tokio::spawn(async move {
            let kind = activity_type(&activity).to_string();
            match delivery.deliver(&activity, &as_account, &inbox_url).await {
                Ok(()) => {
                    ACTIVITYPUB_ACTIVITIES_SENT
                        .with_label_values(&[kind.as_str(), "success"])
                        .inc();
                }
                Err(error) => {
                    ACTIVITYPUB_ACTIVITIES_SENT
                        .with_label_values(&[kind.as_str(), "failure"])
                        .inc();
                    tracing::error!(
                        inbox = %inbox_url,
                        activity_type = %kind,
                        %error,
                        "Delivery failed"
                    );
                }
            }
        })
    }

    /// Deliver one activity to many inboxes
    ///
    /// Identical inbox URLs are delivered once; at most
    /// `MAX_CONCURRENT_DELIVERIES` requests are in flight.
    pub async fn deliver_to_inboxes(
        &self,
        activity: serde_json::Value,
        as_account: Account,
        inbox_urls: Vec<String>,
    ) -> Vec<DeliveryResult> {
        let total_targets = inbox_urls.len();
        let targets = unique_inbox_targets(inbox_urls);

        tracing::info!(
            "Delivering to {} unique inboxes (deduplicated from {} total)",
            targets.len(),
            total_targets
        );

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES));
        let activity = Arc::new(activity);
        let as_account = Arc::new(as_account);
        let kind = activity_type(&activity).to_string();

        let mut tasks = Vec::with_capacity(targets.len());
        for inbox_url in targets {
            let semaphore = semaphore.clone();
            let activity = activity.clone();
            let as_account = as_account.clone();
            let delivery = self.clone();

            tasks.push(tokio::spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => delivery.deliver(&activity, &as_account, &inbox_url).await,
                    Err(e) => Err(AppError::Internal(e.into())),
                };

                DeliveryResult {
                    inbox_url,
                    success: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                }
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(error) => tracing::error!(%error, "Delivery task panicked"),
            }
        }

        for result in &results {
            let status = if result.success { "success" } else { "failure" };
            ACTIVITYPUB_ACTIVITIES_SENT
                .with_label_values(&[kind.as_str(), status])
                .inc();
            if let Some(error) = &result.error {
                tracing::error!(inbox = %result.inbox_url, %error, "Delivery failed");
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            "Batch delivery complete: {} succeeded, {} failed",
            success_count,
            results.len() - success_count
        );

        results
    }

    /// Background fan-out used after local actions
    pub fn spawn_to_inboxes(
        &self,
        activity: serde_json::Value,
        as_account: Account,
        inbox_urls: Vec<String>,
    ) -> JoinHandle<()> {
        let delivery = self.clone();
        tokio::spawn(async move {
            delivery
                .deliver_to_inboxes(activity, as_account, inbox_urls)
                .await;
        })
    }
}
