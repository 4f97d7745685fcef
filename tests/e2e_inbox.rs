//! E2E tests for the signed inbox

mod common;

use common::{RemoteActor, TestServer};
use fedinode::federation::{SignedRequest, verify_digest, verify_with_key};
use http::HeaderValue;
use serde_json::{Value, json};

#[tokio::test]
async fn signed_follow_is_applied_and_accepted() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let follow = bob.follow(&server.local_apid());
    let response = server
        .post_signed(&server.local_inbox_path(), &follow, &bob)
        .await;
    assert_eq!(response.status(), 204);

    let alice = server.local_account().await;
    assert_eq!(alice.follower_count, 1);

    let remote = server
        .state
        .db
        .get_account_by_apid(&bob.apid)
        .await
        .unwrap()
        .expect("sender should have been resolved");
    assert_eq!(remote.host, "127.0.0.1");
    assert_eq!(remote.username, "bob");
    assert_eq!(remote.followee_count, 1);
    assert!(server.state.db.is_following(alice.id, remote.id).await.unwrap());

    // The Accept is signed by alice and wraps the original Follow.
    let received = bob.wait_for_inbox(1).await;
    assert_eq!(received.len(), 1);
    let accept = &received[0];
    let body = accept.json();
    assert_eq!(body["type"], "Accept");
    assert_eq!(body["actor"], server.local_apid());
    assert_eq!(body["object"], follow);

    let request = SignedRequest {
        method: "POST",
        path: &accept.path,
        headers: &accept.headers,
        body: &accept.body,
    };
    assert!(verify_with_key(&request, &alice.public_key_pem));
    let digest = accept.headers.get("digest").unwrap().to_str().unwrap();
    assert!(verify_digest(digest, &accept.body));
}

#[tokio::test]
async fn repeated_follow_keeps_counters_and_sends_fresh_accept() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;
    let follow = bob.follow(&server.local_apid());

    for _ in 0..2 {
        let response = server
            .post_signed(&server.local_inbox_path(), &follow, &bob)
            .await;
        assert_eq!(response.status(), 204);
    }

    assert_eq!(server.local_account().await.follower_count, 1);

    let received = bob.wait_for_inbox(2).await;
    assert_eq!(received.len(), 2);
    assert_ne!(received[0].json()["id"], received[1].json()["id"]);
}

#[tokio::test]
async fn undo_follow_removes_the_edge() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    server
        .post_signed(
            &server.local_inbox_path(),
            &bob.follow(&server.local_apid()),
            &bob,
        )
        .await;
    assert_eq!(server.local_account().await.follower_count, 1);

    let response = server
        .post_signed(
            &server.local_inbox_path(),
            &bob.undo_follow(&server.local_apid()),
            &bob,
        )
        .await;
    assert_eq!(response.status(), 204);

    assert_eq!(server.local_account().await.follower_count, 0);
    let remote = server
        .state
        .db
        .get_account_by_apid(&bob.apid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remote.followee_count, 0);

    // Undo without an edge is a no-op.
    let response = server
        .post_signed(
            &server.local_inbox_path(),
            &bob.undo_follow(&server.local_apid()),
            &bob,
        )
        .await;
    assert_eq!(response.status(), 204);
    assert_eq!(server.local_account().await.follower_count, 0);
}

#[tokio::test]
async fn unknown_account_is_not_found() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let response = server
        .post_signed(
            "/accounts/nobody/inbox",
            &bob.follow(&server.url("/accounts/nobody")),
            &bob,
        )
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn unsigned_request_is_rejected_without_side_effects() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let response = server
        .client
        .post(server.url(&server.local_inbox_path()))
        .header("content-type", "application/activity+json")
        .json(&bob.follow(&server.local_apid()))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["message"],
        "request with invalid signature and/or digest"
    );
    assert_eq!(server.state.db.count_accounts().await.unwrap(), 1);
}

#[tokio::test]
async fn unsupported_algorithm_is_rejected() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let body = serde_json::to_vec(&bob.follow(&server.local_apid())).unwrap();
    let mut headers = bob.signed_headers("POST", &server.local_inbox_path(), &body);
    let signature = headers
        .get("signature")
        .unwrap()
        .to_str()
        .unwrap()
        .replace("rsa-sha256", "hmac-sha256");
    headers.insert("signature", HeaderValue::from_str(&signature).unwrap());

    let response = server
        .post_raw(&server.local_inbox_path(), headers, body)
        .await;

    assert_eq!(response.status(), 400);
    assert_eq!(server.local_account().await.follower_count, 0);
    assert_eq!(server.state.db.count_accounts().await.unwrap(), 1);
}

#[tokio::test]
async fn tampered_body_fails_the_digest() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let body = serde_json::to_vec(&bob.follow(&server.local_apid())).unwrap();
    let headers = bob.signed_headers("POST", &server.local_inbox_path(), &body);
    let mut tampered = body.clone();
    tampered.extend_from_slice(b" ");

    let response = server
        .post_raw(&server.local_inbox_path(), headers, tampered)
        .await;

    assert_eq!(response.status(), 400);
    assert_eq!(server.local_account().await.follower_count, 0);
}

#[tokio::test]
async fn missing_digest_is_rejected_when_required() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let body = serde_json::to_vec(&bob.follow(&server.local_apid())).unwrap();
    let mut headers = bob.signed_headers("POST", &server.local_inbox_path(), &body);
    headers.remove("digest");

    let response = server
        .post_raw(&server.local_inbox_path(), headers, body)
        .await;

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn signature_over_another_path_is_rejected() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let body = serde_json::to_vec(&bob.follow(&server.local_apid())).unwrap();
    let headers = bob.signed_headers("POST", "/accounts/someone-else/inbox", &body);

    let response = server
        .post_raw(&server.local_inbox_path(), headers, body)
        .await;

    assert_eq!(response.status(), 400);
    assert_eq!(server.local_account().await.follower_count, 0);
}

#[tokio::test]
async fn signer_must_be_the_activity_actor() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;
    let mallory = RemoteActor::spawn("mallory").await;

    // Valid signature by bob on an activity claiming to come from mallory.
    let follow = mallory.follow(&server.local_apid());
    let response = server
        .post_signed(&server.local_inbox_path(), &follow, &bob)
        .await;

    assert_eq!(response.status(), 400);
    assert_eq!(server.local_account().await.follower_count, 0);
    assert!(
        server
            .state
            .db
            .get_account_by_apid(&mallory.apid)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn stale_date_is_rejected() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let body = serde_json::to_vec(&bob.follow(&server.local_apid())).unwrap();
    let mut headers = bob.signed_headers("POST", &server.local_inbox_path(), &body);
    // Also breaks the signature; either check alone must refuse it.
    headers.insert(
        "date",
        HeaderValue::from_static("Sun, 05 Jan 2014 21:31:40 GMT"),
    );

    let response = server
        .post_raw(&server.local_inbox_path(), headers, body)
        .await;

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn signed_garbage_is_malformed() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let body = b"not json".to_vec();
    let headers = bob.signed_headers("POST", &server.local_inbox_path(), &body);

    let response = server
        .post_raw(&server.local_inbox_path(), headers, body)
        .await;

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn unsupported_activities_are_acknowledged_without_effect() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let like = json!({
        "type": "Like",
        "actor": bob.apid,
        "object": server.url("/posts/1")
    });
    let undo_like = json!({
        "type": "Undo",
        "actor": bob.apid,
        "object": {"type": "Like", "actor": bob.apid, "object": server.url("/posts/1")}
    });
    let follow_someone_else = bob.follow(&server.url("/accounts/carol"));

    for activity in [like, undo_like, follow_someone_else] {
        let response = server
            .post_signed(&server.local_inbox_path(), &activity, &bob)
            .await;
        assert_eq!(response.status(), 204, "{activity}");
    }

    assert_eq!(server.local_account().await.follower_count, 0);
    assert_eq!(bob.inbox_len().await, 0);
}

#[tokio::test]
async fn follow_from_blocked_actor_is_ignored() {
    let server = TestServer::new().await;
    let bob = RemoteActor::spawn("bob").await;

    let remote = server.state.resolver.resolve(&bob.apid).await.unwrap();
    let alice = server.local_account().await;
    server.state.ledger.block(alice.id, remote.id).await.unwrap();

    let response = server
        .post_signed(
            &server.local_inbox_path(),
            &bob.follow(&server.local_apid()),
            &bob,
        )
        .await;

    assert_eq!(response.status(), 204);
    assert_eq!(server.local_account().await.follower_count, 0);
    assert!(!server.state.db.is_following(alice.id, remote.id).await.unwrap());

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(bob.inbox_len().await, 0);
}

#[tokio::test]
async fn digest_can_be_optional() {
    let server = TestServer::with_federation(|federation| federation.require_digest = false).await;
    let bob = RemoteActor::spawn("bob").await;

    let body = serde_json::to_vec(&bob.follow(&server.local_apid())).unwrap();
    let mut headers = bob.signed_headers("POST", &server.local_inbox_path(), &body);
    // Signed headers must be present, so re-sign without digest.
    headers.remove("digest");
    headers.remove("signature");
    let private_key = fedinode::federation::keys::decode_private_key(&bob.private_key_pem).unwrap();
    let signature = fedinode::federation::sign(
        "POST",
        &server.local_inbox_path(),
        &headers,
        &["(request-target)", "date"],
        &private_key,
        &bob.key_id,
    )
    .unwrap();
    headers.insert("signature", HeaderValue::from_str(&signature).unwrap());

    let response = server
        .post_raw(&server.local_inbox_path(), headers, body)
        .await;

    assert_eq!(response.status(), 204);
    assert_eq!(server.local_account().await.follower_count, 1);
}
