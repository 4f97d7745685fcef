//! ActivityPub endpoints
//!
//! - Actor document
//! - Personal inbox (activity receiving)

use axum::body::Bytes;
use axum::{
    Json, Router,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::AppState;
use crate::error::AppError;
use crate::federation::activity::person;
use crate::federation::{ACTIVITY_JSON, InboxOutcome, SignedRequest};
use crate::metrics::{HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL};

/// Create ActivityPub router
///
/// Routes:
/// - GET /accounts/:username - Actor document
/// - POST /accounts/:username/inbox - Personal inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/accounts/:username", get(actor))
        .route("/accounts/:username/inbox", post(inbox))
}

/// GET /accounts/:username
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/accounts/:username"])
        .start_timer();

    let account = state.accounts.get_local_account(&username).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/accounts/:username", "200"])
        .inc();

    Ok((
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        Json(person(&account)),
    )
        .into_response())
}

/// POST /accounts/:username/inbox
///
/// The raw body and the request line are handed to the inbox dispatcher
/// untouched; the signature and digest are computed over them.
///
/// Answers 204 for applied, ignored and unsupported activities alike.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/accounts/:username/inbox"])
        .start_timer();

    let path = uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or_else(|| uri.path());

    let request = SignedRequest {
        method: method.as_str(),
        path,
        headers: &headers,
        body: &body,
    };

    let result = state.inbox.dispatch(&username, &request).await;

    let status = match &result {
        Ok(_) => "204",
        Err(AppError::NotFound) => "404",
        Err(AppError::InvalidSignature) | Err(AppError::MalformedActivity(_)) => "400",
        Err(_) => "error",
    };
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/accounts/:username/inbox", status])
        .inc();

    match result? {
        InboxOutcome::Unsupported { reason } => {
            tracing::debug!(account = %username, reason = %reason, "Unsupported activity acknowledged");
        }
        outcome => {
            tracing::debug!(account = %username, ?outcome, "Inbox request handled");
        }
    }

    Ok(StatusCode::NO_CONTENT)
}
