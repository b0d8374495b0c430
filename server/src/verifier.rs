//! Signed credential tokens.
//!
//! A token is `<payload>.<signature>`: the base64url (unpadded) JSON [Claims]
//! followed by the base64url Ed25519 signature over the payload segment as
//! sent.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use punchcard_types::{Claims, ProgressReport};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("malformed token")]
    Malformed,
    #[error("token is not valid base64url")]
    Encoding(#[from] base64::DecodeError),
    #[error("invalid token claims: {0}")]
    Claims(#[from] serde_json::Error),
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token is missing wallet_address")]
    MissingAddress,
    #[error("invalid verifying key: {0}")]
    Key(String),
}

/// The verified identity and the report it carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub address: String,
    pub report: ProgressReport,
}

pub trait CredentialVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> Result<Credential, VerificationError>;
}

pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Parse a hex-encoded 32-byte public key.
    pub fn from_hex(hex_key: &str) -> Result<Self, VerificationError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|err| VerificationError::Key(err.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| VerificationError::Key("expected 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|err| VerificationError::Key(err.to_string()))?;
        Ok(Self::new(key))
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.key
    }
}

impl CredentialVerifier for Ed25519Verifier {
    fn verify(&self, token: &str) -> Result<Credential, VerificationError> {
        let (payload, signature) = token
            .trim()
            .split_once('.')
            .ok_or(VerificationError::Malformed)?;
        if payload.is_empty() || signature.is_empty() || signature.contains('.') {
            return Err(VerificationError::Malformed);
        }

        let signature = URL_SAFE_NO_PAD.decode(signature)?;
        let signature =
            Signature::from_slice(&signature).map_err(|_| VerificationError::BadSignature)?;
        self.key
            .verify_strict(payload.as_bytes(), &signature)
            .map_err(|_| VerificationError::BadSignature)?;

        let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload)?)?;
        if let Some(exp) = claims.exp {
            if exp <= unix_now() {
                return Err(VerificationError::Expired);
            }
        }
        let address = claims.wallet_address.trim();
        if address.is_empty() {
            return Err(VerificationError::MissingAddress);
        }

        Ok(Credential {
            address: address.to_string(),
            report: claims.report(),
        })
    }
}

/// Produce a token for `claims` that [Ed25519Verifier] accepts.
pub fn sign_token(key: &SigningKey, claims: &Claims) -> Result<String, VerificationError> {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signature = key.sign(payload.as_bytes());
    Ok(format!(
        "{payload}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
