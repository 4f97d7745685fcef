//! Activity vocabulary
//!
//! Classification of inbound activities and builders for the documents
//! this node publishes (Person, Accept, Create/Note).

use serde_json::{Value, json};

use crate::data::{Account, Post};
use crate::error::AppError;

pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Inbound activity kinds, keyed on `type` and, for `Undo`, `object.type`
#[derive(Debug, Clone, PartialEq)]
pub enum InboundActivity {
    /// `actor` asks to follow `object`
    Follow {
        actor: String,
        object: String,
        activity: Value,
    },
    /// `actor` withdraws an earlier Follow of `object`
    UndoFollow { actor: String, object: Option<String> },
    /// `Undo` wrapping something other than a Follow
    UnsupportedUndo {
        actor: String,
        inner_type: Option<String>,
    },
    /// Any other top-level type
    Unsupported { actor: String, activity_type: String },
}

impl InboundActivity {
    pub fn actor(&self) -> &str {
        match self {
            InboundActivity::Follow { actor, .. }
            | InboundActivity::UndoFollow { actor, .. }
            | InboundActivity::UnsupportedUndo { actor, .. }
            | InboundActivity::Unsupported { actor, .. } => actor,
        }
    }

    /// Label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            InboundActivity::Follow { .. } => "Follow",
            InboundActivity::UndoFollow { .. } => "Undo",
            InboundActivity::UnsupportedUndo { .. } => "Undo",
            InboundActivity::Unsupported { .. } => "other",
        }
    }
}

/// Read an id that may be given inline (`"..."`) or as `{"id": "..."}`
fn id_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) => Some(id.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

/// Classify an inbound activity document
///
/// # Errors
/// `MalformedActivity` when the body is not an object or lacks a string
/// `type` or an `actor`. Unknown types are not errors; they classify as
/// `Unsupported`.
pub fn classify(activity: &Value) -> Result<InboundActivity, AppError> {
    let map = activity
        .as_object()
        .ok_or_else(|| AppError::MalformedActivity("activity must be a JSON object".to_string()))?;

    let activity_type = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::MalformedActivity("activity has no type".to_string()))?;

    let actor = map
        .get("actor")
        .and_then(id_of)
        .ok_or_else(|| AppError::MalformedActivity("activity has no actor".to_string()))?
        .to_string();

    let object = map.get("object");

    let classified = match activity_type {
        "Follow" => match object.and_then(id_of) {
            Some(target) => InboundActivity::Follow {
                actor,
                object: target.to_string(),
                activity: activity.clone(),
            },
            None => InboundActivity::Unsupported {
                actor,
                activity_type: activity_type.to_string(),
            },
        },
        "Undo" => {
            let inner_type = object
                .and_then(|inner| inner.get("type"))
                .and_then(Value::as_str);
            match inner_type {
                Some("Follow") => InboundActivity::UndoFollow {
                    actor,
                    object: object
                        .and_then(|inner| inner.get("object"))
                        .and_then(id_of)
                        .map(str::to_string),
                },
                other => InboundActivity::UnsupportedUndo {
                    actor,
                    inner_type: other.map(str::to_string),
                },
            }
        }
        other => InboundActivity::Unsupported {
            actor,
            activity_type: other.to_string(),
        },
    };

    Ok(classified)
}

/// Fresh 128-bit hex token for activity ids
fn random_hex() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Build an Accept answering `follow`
///
/// The id is unique per call, so a repeated Follow gets a new Accept.
pub fn accept_follow(local: &Account, remote: &Account, follow: Value) -> Value {
    let id = format!(
        "{}/activities/accept-following-{}-by-{}-{}-{}",
        local.apid,
        local.username,
        remote.username,
        remote.host,
        random_hex()
    );

    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "id": id,
        "type": "Accept",
        "actor": local.apid,
        "object": follow,
    })
}

/// Build the `Create{Note}` announcing a local post
pub fn create_note(base_url: &str, author: &Account, post: &Post) -> Value {
    let note_id = format!("{}/posts/{}", base_url, post.id);
    let content = post.content.clone().unwrap_or_default();
    let published = post.created_at.to_rfc3339();

    json!({
        "@context": ACTIVITYSTREAMS_CONTEXT,
        "id": format!("{}/create-activity", note_id),
        "type": "Create",
        "actor": author.apid,
        "published": published,
        "to": [PUBLIC_COLLECTION],
        "cc": [],
        "object": {
            "id": note_id,
            "type": "Note",
            "url": note_id,
            "attributedTo": author.apid,
            "summary": "",
            "content": content,
            "source": {
                "content": content,
                "mediaType": "text/plain"
            },
            "published": published,
            "to": [PUBLIC_COLLECTION],
            "cc": []
        }
    })
}

/// Actor document (`Person`) for a local account
pub fn person(account: &Account) -> Value {
    json!({
        "@context": [ACTIVITYSTREAMS_CONTEXT, SECURITY_CONTEXT],
        "id": account.apid,
        "type": "Person",
        "preferredUsername": account.username,
        "name": account.username,
        "inbox": account.inbox_url,
        "url": account.apid,
        "publicKey": {
            "id": account.key_id(),
            "owner": account.apid,
            "publicKeyPem": account.public_key_pem
        }
    })
}
