//! Inbox activity dispatch
//!
//! Verifies an inbound POST, classifies the activity and applies it:
//!
//! ```text
//! digest ─▶ date ─▶ signature ─▶ classify ─▶ keyId/actor ─▶ resolve ─▶ ledger ─▶ Accept
//! ```
//!
//! Any verification failure stops the pipeline before the ledger is
//! touched and surfaces as `AppError::InvalidSignature`.

use std::sync::Arc;

use super::activity::{InboundActivity, accept_follow, classify};
use super::actor::ActorResolver;
use super::delivery::ActivityDelivery;
use super::digest::verify_digest;
use super::fetch::ActorFetcher;
use super::signature::{
    SignedRequest, date_is_fresh, key_id_matches_actor, signature_from_headers, verify_request,
};
use crate::config::FederationConfig;
use crate::data::{Account, Database, FollowOutcome, RelationshipLedger};
use crate::error::AppError;
use crate::metrics::{ACTIVITYPUB_ACTIVITIES_RECEIVED, FEDERATION_REQUESTS_TOTAL};

/// What an accepted inbound activity did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    /// Follow applied (or already present) and an Accept dispatched
    Followed { remote_apid: String, created: bool },
    /// Undo of a Follow; `removed` is false when there was no edge
    Unfollowed { remote_apid: String, removed: bool },
    /// Follow between blocked parties; nothing changed and nothing sent
    Ignored { reason: String },
    /// Well-formed and verified, but not something this node handles
    Unsupported { reason: String },
}

/// Applies verified inbound activities addressed to local accounts
#[derive(Clone)]
pub struct InboxDispatcher {
    db: Arc<Database>,
    ledger: RelationshipLedger,
    resolver: ActorResolver,
    fetcher: ActorFetcher,
    delivery: ActivityDelivery,
    config: FederationConfig,
}

impl InboxDispatcher {
    pub fn new(
        db: Arc<Database>,
        ledger: RelationshipLedger,
        resolver: ActorResolver,
        fetcher: ActorFetcher,
        delivery: ActivityDelivery,
        config: FederationConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            resolver,
            fetcher,
            delivery,
            config,
        }
    }

    /// Handle one POST to `username`'s inbox
    ///
    /// # Errors
    /// - `NotFound` when `username` is not a local account
    /// - `InvalidSignature` when digest, date, signature or actor checks fail
    /// - `MalformedActivity` when the verified body is not an activity
    pub async fn dispatch(
        &self,
        username: &str,
        request: &SignedRequest<'_>,
    ) -> Result<InboxOutcome, AppError> {
        let local = self
            .db
            .get_local_account(username)
            .await?
            .ok_or(AppError::NotFound)?;

        let result = self.dispatch_to(&local, request).await;

        let status = match &result {
            Ok(_) => "success",
            Err(AppError::InvalidSignature) => "rejected",
            Err(_) => "error",
        };
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", status])
            .inc();

        result
    }

    async fn dispatch_to(
        &self,
        local: &Account,
        request: &SignedRequest<'_>,
    ) -> Result<InboxOutcome, AppError> {
        self.verify(request).await?;

        let activity: serde_json::Value = serde_json::from_slice(request.body)
            .map_err(|e| AppError::MalformedActivity(format!("body is not JSON: {}", e)))?;
        let inbound = classify(&activity)?;

        ACTIVITYPUB_ACTIVITIES_RECEIVED
            .with_label_values(&[inbound.kind()])
            .inc();

        // The signer must be the actor the activity speaks for.
        let key_id = signature_from_headers(request.headers)
            .map_err(|_| AppError::InvalidSignature)?
            .key_id;
        if !key_id_matches_actor(&key_id, inbound.actor()) {
            tracing::warn!(
                key_id = %key_id,
                actor = %inbound.actor(),
                "Signature key does not belong to activity actor"
            );
            return Err(AppError::InvalidSignature);
        }

        let outcome = match inbound {
            InboundActivity::Follow {
                actor,
                object,
                activity,
            } => self.handle_follow(local, &actor, &object, activity).await?,
            InboundActivity::UndoFollow { actor, object } => {
                self.handle_undo_follow(local, &actor, object.as_deref())
                    .await?
            }
            InboundActivity::UnsupportedUndo { inner_type, .. } => InboxOutcome::Unsupported {
                reason: format!(
                    "Undo of {} is not supported",
                    inner_type.as_deref().unwrap_or("an untyped object")
                ),
            },
            InboundActivity::Unsupported { activity_type, .. } => InboxOutcome::Unsupported {
                reason: format!("{} activities are not supported", activity_type),
            },
        };

        match &outcome {
            InboxOutcome::Unsupported { reason } | InboxOutcome::Ignored { reason } => {
                tracing::info!(account = %local.username, reason = %reason, "Inbound activity not applied");
            }
            applied => {
                tracing::info!(account = %local.username, outcome = ?applied, "Inbound activity applied");
            }
        }

        Ok(outcome)
    }

    /// Digest, then date freshness, then signature
    async fn verify(&self, request: &SignedRequest<'_>) -> Result<(), AppError> {
        match request.headers.get("digest") {
            Some(value) => {
                let valid = value
                    .to_str()
                    .map(|digest| verify_digest(digest, request.body))
                    .unwrap_or(false);
                if !valid {
                    tracing::warn!(path = %request.path, "Digest mismatch");
                    return Err(AppError::InvalidSignature);
                }
            }
            None if self.config.require_digest && !request.body.is_empty() => {
                tracing::warn!(path = %request.path, "Missing Digest header");
                return Err(AppError::InvalidSignature);
            }
            None => {}
        }

        if !date_is_fresh(request.headers, self.config.max_date_skew_seconds) {
            tracing::warn!(path = %request.path, "Date header missing or outside allowed skew");
            return Err(AppError::InvalidSignature);
        }

        if !verify_request(request, &self.fetcher).await {
            return Err(AppError::InvalidSignature);
        }

        Ok(())
    }

    /// Resolve the sender; an unusable actor document fails verification
    async fn resolve_sender(&self, actor: &str) -> Result<Account, AppError> {
        match self.resolver.resolve(actor).await {
            Ok(account) if account.is_local() => {
                tracing::warn!(actor = %actor, "Inbound activity claims a local actor");
                Err(AppError::InvalidSignature)
            }
            Ok(account) => Ok(account),
            Err(AppError::Federation(reason)) => {
                tracing::warn!(actor = %actor, reason = %reason, "Could not resolve sender");
                Err(AppError::InvalidSignature)
            }
            Err(error) => Err(error),
        }
    }

    async fn handle_follow(
        &self,
        local: &Account,
        actor: &str,
        object: &str,
        activity: serde_json::Value,
    ) -> Result<InboxOutcome, AppError> {
        if object != local.apid {
            return Ok(InboxOutcome::Unsupported {
                reason: format!("Follow target {} is not {}", object, local.apid),
            });
        }

        let remote = self.resolve_sender(actor).await?;

        let outcome = self.ledger.follow(local.id, remote.id).await?;
        if outcome == FollowOutcome::Blocked {
            return Ok(InboxOutcome::Ignored {
                reason: format!("{} and {} block each other", remote.apid, local.apid),
            });
        }

        let accept = accept_follow(local, &remote, activity);
        self.delivery
            .spawn_delivery(accept, local.clone(), remote.inbox_url.clone());

        Ok(InboxOutcome::Followed {
            remote_apid: remote.apid,
            created: outcome.is_created(),
        })
    }

    async fn handle_undo_follow(
        &self,
        local: &Account,
        actor: &str,
        object: Option<&str>,
    ) -> Result<InboxOutcome, AppError> {
        if let Some(object) = object.filter(|object| *object != local.apid) {
            return Ok(InboxOutcome::Unsupported {
                reason: format!("Undo target {} is not {}", object, local.apid),
            });
        }

        let remote = self.resolve_sender(actor).await?;
        let removed = self.ledger.unfollow(local.id, remote.id).await?;

        Ok(InboxOutcome::Unfollowed {
            remote_apid: remote.apid,
            removed,
        })
    }
}
