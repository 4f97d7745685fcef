//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /nodeinfo/2.1

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::ACTIVITY_JSON;

const JRD_JSON: &str = "application/jrd+json";
const NODEINFO_2_1_SCHEMA: &str = "http://nodeinfo.diaspora.software/ns/schema/2.1";
const NODEINFO_2_1_CONTENT_TYPE: &str =
    "application/json; profile=\"http://nodeinfo.diaspora.software/ns/schema/2.1#\"";
const PROFILE_PAGE_REL: &str = "http://webfinger.net/rel/profile-page";

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /nodeinfo/2.1
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/nodeinfo/2.1", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: Option<String>,
}

/// Split `acct:username@host`
fn parse_acct(resource: &str) -> Option<(&str, &str)> {
    let acct = resource.strip_prefix("acct:")?;
    let mut parts = acct.split('@');
    let username = parts.next()?;
    let host = parts.next()?;
    if parts.next().is_some() || username.is_empty() || host.is_empty() {
        return None;
    }
    Some((username, host))
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
///
/// 400 when the resource is absent or malformed, 404 when it names
/// another host or an unknown account.
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let resource = query
        .resource
        .ok_or_else(|| AppError::Validation("resource is required".to_string()))?;

    let (username, host) = parse_acct(&resource).ok_or_else(|| {
        AppError::Validation("resource must be of the form acct:username@host".to_string())
    })?;

    if host != state.config.server.domain {
        return Err(AppError::NotFound);
    }

    let account = state.accounts.get_local_account(username).await?;

    let body = serde_json::json!({
        "subject": resource,
        "links": [
            {
                "rel": "self",
                "type": ACTIVITY_JSON,
                "href": account.apid
            },
            {
                "rel": PROFILE_PAGE_REL,
                "type": "text/html",
                "href": account.apid
            }
        ]
    });

    Ok(([(header::CONTENT_TYPE, JRD_JSON)], Json(body)).into_response())
}

/// GET /.well-known/nodeinfo
///
/// Returns links to nodeinfo documents.
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base_url = state.config.server.base_url();
    Json(serde_json::json!({
        "links": [
            {
                "rel": NODEINFO_2_1_SCHEMA,
                "href": format!("{}/nodeinfo/2.1", base_url)
            }
        ]
    }))
}

/// GET /nodeinfo/2.1
async fn nodeinfo(State(state): State<AppState>) -> Result<Response, AppError> {
    let users = state.db.count_local_accounts().await?;
    let local_posts = state.db.count_local_posts().await?;

    let body = serde_json::json!({
        "version": "2.1",
        "software": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "protocols": ["activitypub"],
        "services": {
            "inbound": [],
            "outbound": []
        },
        "openRegistrations": true,
        "usage": {
            "users": {
                "total": users
            },
            "localPosts": local_posts
        },
        "metadata": {}
    });

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, NODEINFO_2_1_CONTENT_TYPE)],
        Json(body),
    )
        .into_response())
}
