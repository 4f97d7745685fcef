//! Key material for local accounts
//!
//! Public keys are SPKI PEM, private keys PKCS#8 PEM. Decoding also
//! accepts PKCS#1 PEM since some servers still publish keys that way.

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::data::Account;
use crate::error::AppError;

/// PEM-encoded RSA key pair
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key_pem: String,
    pub private_key_pem: String,
}

/// Generate a fresh RSA key pair on a blocking thread
pub async fn generate_key_pair(bits: usize) -> Result<KeyPair, AppError> {
    tokio::task::spawn_blocking(move || generate_key_pair_blocking(bits))
        .await
        .map_err(|e| AppError::Internal(e.into()))?
}

fn generate_key_pair_blocking(bits: usize) -> Result<KeyPair, AppError> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| AppError::KeyMaterial(format!("key generation failed: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| AppError::KeyMaterial(e.to_string()))?
        .to_string();
    let public_key_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| AppError::KeyMaterial(e.to_string()))?;

    Ok(KeyPair {
        public_key_pem,
        private_key_pem,
    })
}

pub fn decode_private_key(pem: &str) -> Result<RsaPrivateKey, AppError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::KeyMaterial(format!("invalid private key: {}", e)))
}

pub fn decode_public_key(pem: &str) -> Result<RsaPublicKey, AppError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| AppError::KeyMaterial(format!("invalid public key: {}", e)))
}

/// Private key used to sign on behalf of `account`
///
/// Every local account carries a private key, so a missing or unreadable
/// key here is a broken invariant rather than a remote failure.
pub fn signing_key_for(account: &Account) -> Result<RsaPrivateKey, AppError> {
    let pem = account.private_key_pem.as_deref().ok_or_else(|| {
        tracing::error!(
            account_id = account.id,
            apid = %account.apid,
            "Account has no private key"
        );
        AppError::KeyMaterial(format!("account {} has no private key", account.id))
    })?;

    decode_private_key(pem).inspect_err(|error| {
        tracing::error!(account_id = account.id, %error, "Stored private key is unusable");
    })
}
