//! Body digests (`Digest: SHA-256=...`)

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};

const SHA256_PREFIX: &str = "SHA-256=";

/// Generate SHA-256 digest header value for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("{}{}", SHA256_PREFIX, BASE64.encode(hash))
}

/// Check a `Digest` header value against the raw body bytes
///
/// Only `SHA-256=` is understood; any other algorithm fails.
pub fn verify_digest(header_value: &str, body: &[u8]) -> bool {
    let Some(claimed) = header_value.trim().strip_prefix(SHA256_PREFIX) else {
        tracing::debug!(digest = %header_value, "Unsupported digest algorithm");
        return false;
    };

    let expected = BASE64.encode(Sha256::digest(body));
    claimed == expected
}
