//! HTTP Signatures
//!
//! Implements the `Signature` header scheme used between fediverse
//! servers (draft-cavage-http-signatures), restricted to `rsa-sha256`.
//! See https://docs.joinmastodon.org/spec/security/
//!
//! Verification never errors outward: every failure, including an
//! unreachable key owner, collapses to `false` with a logged reason.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

use super::fetch::ActorFetcher;
use super::keys::decode_public_key;

/// The only signature algorithm this node speaks.
pub const SIGNATURE_ALGORITHM: &str = "rsa-sha256";

/// Pseudo-header covering the lowercased method and the request path.
pub const REQUEST_TARGET: &str = "(request-target)";

/// Headers covered by signatures this node produces.
pub const OUTBOUND_SIGNED_HEADERS: [&str; 2] = [REQUEST_TARGET, "date"];

/// Reasons a signature is refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing Signature header")]
    MissingHeader,
    #[error("malformed Signature header: {0}")]
    Malformed(String),
    #[error("missing signature field: {0}")]
    MissingField(&'static str),
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("signed header not present on request: {0}")]
    MissingSignedHeader(String),
    #[error("signature is not valid base64")]
    Encoding,
    #[error("public key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("signature does not match")]
    Mismatch,
}

/// One HTTP exchange as seen by the signer or verifier
///
/// `path` is the path plus query exactly as it appeared on the request line.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (always rsa-sha256 once accepted)
    pub algorithm: String,
    /// Signed header names, lowercased, in signing order
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
///
/// Each pair is split on its first `=` only, so base64 padding survives.
/// All four fields are required and the algorithm must be `rsa-sha256`.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| SignatureError::Malformed(format!("expected key=value in {part:?}")))?;
        let value = unquote(value.trim())?;

        match key.trim() {
            "keyId" => key_id = Some(value),
            "algorithm" => algorithm = Some(value),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|name| name.to_ascii_lowercase())
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature = Some(value),
            _ => {} // created, expires, ... are not used
        }
    }

    let parsed = ParsedSignature {
        key_id: key_id.ok_or(SignatureError::MissingField("keyId"))?,
        algorithm: algorithm.ok_or(SignatureError::MissingField("algorithm"))?,
        headers: headers.ok_or(SignatureError::MissingField("headers"))?,
        signature: signature.ok_or(SignatureError::MissingField("signature"))?,
    };

    if parsed.algorithm != SIGNATURE_ALGORITHM {
        return Err(SignatureError::UnsupportedAlgorithm(parsed.algorithm));
    }
    if parsed.headers.is_empty() {
        return Err(SignatureError::MissingField("headers"));
    }

    Ok(parsed)
}

fn unquote(value: &str) -> Result<String, SignatureError> {
    match value.strip_prefix('"') {
        Some(rest) => rest
            .strip_suffix('"')
            .map(str::to_string)
            .ok_or_else(|| SignatureError::Malformed(format!("unterminated quote in {value:?}"))),
        None => Ok(value.to_string()),
    }
}

/// Build the signing string for `header_names` from the live request
///
/// Lines are `name: value` joined by `\n`. Only the request-target line is
/// case-normalized (lowercased method); header values are copied verbatim.
pub fn build_signing_string<S: AsRef<str>>(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    header_names: &[S],
) -> Result<String, SignatureError> {
    let mut lines = Vec::with_capacity(header_names.len());

    for name in header_names {
        let name = name.as_ref().to_ascii_lowercase();
        let value = if name == REQUEST_TARGET {
            format!("{} {}", method.to_ascii_lowercase(), path)
        } else {
            let values = headers
                .get_all(name.as_str())
                .iter()
                .map(|value| value.to_str().map(str::trim))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| SignatureError::MissingSignedHeader(name.clone()))?;
            if values.is_empty() {
                return Err(SignatureError::MissingSignedHeader(name));
            }
            values.join(", ")
        };
        lines.push(format!("{}: {}", name, value));
    }

    Ok(lines.join("\n"))
}

/// Sign a request with a local account's key
///
/// Every name in `header_names` other than `(request-target)` must already
/// be present in `headers`.
///
/// # Returns
/// The `Signature` header value
pub fn sign(
    method: &str,
    path: &str,
    headers: &HeaderMap,
    header_names: &[&str],
    private_key: &RsaPrivateKey,
    key_id: &str,
) -> Result<String, SignatureError> {
    let signing_string = build_signing_string(method, path, headers, header_names)?;

    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    Ok(format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id,
        SIGNATURE_ALGORITHM,
        header_names.join(" "),
        signature_b64
    ))
}

/// Read and parse the request's `Signature` header
pub fn signature_from_headers(headers: &HeaderMap) -> Result<ParsedSignature, SignatureError> {
    let value = headers
        .get("signature")
        .ok_or(SignatureError::MissingHeader)?
        .to_str()
        .map_err(|_| SignatureError::Malformed("non-ASCII header value".to_string()))?;

    parse_signature_header(value)
}

/// Check a parsed signature against a public key
pub fn verify_parsed(
    request: &SignedRequest<'_>,
    parsed: &ParsedSignature,
    public_key: &RsaPublicKey,
) -> Result<(), SignatureError> {
    let signing_string =
        build_signing_string(
            request.method,
            request.path,
            request.headers,
            parsed.headers.as_slice(),
        )?;

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| SignatureError::Encoding)?;
    let signature =
        Pkcs1v15Signature::try_from(signature_bytes.as_slice()).map_err(|_| SignatureError::Encoding)?;

    VerifyingKey::<Sha256>::new(public_key.clone())
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| SignatureError::Mismatch)
}

/// Verify a request against a known public key (PEM)
pub fn verify_with_key(request: &SignedRequest<'_>, public_key_pem: &str) -> bool {
    let result = signature_from_headers(request.headers).and_then(|parsed| {
        let public_key = decode_public_key(public_key_pem)
            .map_err(|e| SignatureError::KeyUnavailable(e.to_string()))?;
        verify_parsed(request, &parsed, &public_key)
    });

    match result {
        Ok(()) => true,
        Err(error) => {
            tracing::debug!(%error, "Signature rejected");
            false
        }
    }
}

/// Verify a request, fetching the public key from the `keyId` owner
///
/// The header is parsed and the algorithm checked before anything is
/// fetched. Fetch failures count as verification failures.
pub async fn verify_request(request: &SignedRequest<'_>, fetcher: &ActorFetcher) -> bool {
    match verify_request_inner(request, fetcher).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(%error, path = %request.path, "Signature rejected");
            false
        }
    }
}

async fn verify_request_inner(
    request: &SignedRequest<'_>,
    fetcher: &ActorFetcher,
) -> Result<(), SignatureError> {
    let parsed = signature_from_headers(request.headers)?;
    let public_key_pem = fetch_public_key(&parsed.key_id, fetcher)
        .await
        .map_err(|e| SignatureError::KeyUnavailable(e.to_string()))?;
    let public_key =
        decode_public_key(&public_key_pem).map_err(|e| SignatureError::KeyUnavailable(e.to_string()))?;

    verify_parsed(request, &parsed, &public_key)
}

/// Fetch public key PEM from key ID URL
///
/// When the key id carries a fragment, the actor must advertise exactly
/// that key id.
pub async fn fetch_public_key(
    key_id: &str,
    fetcher: &ActorFetcher,
) -> Result<String, crate::error::AppError> {
    use crate::error::AppError;

    let actor = fetcher.fetch_document(key_id).await?;

    let public_key = actor
        .get("publicKey")
        .ok_or_else(|| AppError::Federation("Missing publicKey in actor".to_string()))?;

    if key_id.contains('#') {
        let advertised_key_id = public_key
            .get("id")
            .and_then(|id| id.as_str())
            .ok_or_else(|| AppError::Federation("Missing publicKey.id in actor".to_string()))?;

        if advertised_key_id != key_id {
            return Err(AppError::Federation(
                "Signature keyId does not match actor public key id".to_string(),
            ));
        }
    }

    public_key
        .get("publicKeyPem")
        .and_then(|pem| pem.as_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::Federation("Missing publicKeyPem in actor".to_string()))
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    super::fetch::document_url(key_id) == super::fetch::document_url(actor_id)
}

/// HTTP `Date` header value for now
pub fn http_date_now() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// True when the `Date` header is within `max_skew_seconds` of now
///
/// A skew of 0 disables the check. A missing or unparsable date fails.
pub fn date_is_fresh(headers: &HeaderMap, max_skew_seconds: u64) -> bool {
    if max_skew_seconds == 0 {
        return true;
    }

    let Some(date) = headers.get("date").and_then(|value| value.to_str().ok()) else {
        return false;
    };
    let Ok(date) = DateTime::parse_from_rfc2822(date) else {
        return false;
    };

    let diff = (Utc::now().timestamp() - date.timestamp()).unsigned_abs();
    diff <= max_skew_seconds
}
