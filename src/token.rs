use crate::{entries::QueueId, keys::Keys, store::Store, store::StoreError};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use strum::IntoStaticStr;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Wire limit for encoded tokens.
pub const TOKEN_MAX_BYTES: usize = 512;

const MAC_LEN: usize = 32;

/// The authenticated binding carried inside an admission token.
///
/// Serialized canonically: field order below is fixed (lexicographic), and
/// the MAC covers the serialized bytes, so any reordering or edit invalidates
/// the signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBinding {
    pub device_id: String,
    pub event_id: String,
    pub expires_at_ms: u64,
    pub issued_at_ms: u64,
    pub queue_id: QueueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("could not encode token binding: {0}")]
    Encode(String),
    #[error("signing key rejected")]
    Key,
    #[error("token would be {0} bytes, limit is {TOKEN_MAX_BYTES}")]
    Oversized(usize),
}

#[derive(Debug, Error, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum VerifyError {
    #[error("token is not decodable")]
    Malformed,
    #[error("token signature does not verify")]
    SignatureInvalid,
    #[error("token has expired")]
    Expired,
    #[error("token was issued to a different device")]
    DeviceMismatch,
    #[error("token has been revoked")]
    Revoked,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mints admission tokens under the primary signing key.
#[derive(Clone)]
pub struct TokenSigner {
    keys: Arc<Keys>,
}

impl TokenSigner {
    #[must_use]
    pub fn new(keys: Arc<Keys>) -> Self {
        Self { keys }
    }

    pub fn mint(&self, binding: &TokenBinding) -> Result<String, SignError> {
        let payload =
            serde_json::to_vec(binding).map_err(|error| SignError::Encode(error.to_string()))?;
        let tag = mac_bytes(self.keys.primary(), &payload).ok_or(SignError::Key)?;
        let mut raw = payload;
        raw.extend_from_slice(&tag);
        let token = base64::encode_config(raw, base64::URL_SAFE_NO_PAD);
        if token.len() > TOKEN_MAX_BYTES {
            return Err(SignError::Oversized(token.len()));
        }
        Ok(token)
    }
}

/// Validates presented tokens against every accepted key.
#[derive(Clone)]
pub struct TokenVerifier {
    keys: Arc<Keys>,
}

impl TokenVerifier {
    #[must_use]
    pub fn new(keys: Arc<Keys>) -> Self {
        Self { keys }
    }

    /// Stateless checks, in a fixed order: decode, MAC, expiry, device. The
    /// MAC is checked before any content-dependent step so a forged token
    /// learns nothing about how its payload would have been read.
    pub fn verify(
        &self,
        token: &str,
        presented_device_id: &str,
        now_ms: u64,
    ) -> Result<TokenBinding, VerifyError> {
        if token.is_empty() || token.len() > TOKEN_MAX_BYTES {
            return Err(VerifyError::Malformed);
        }
        let raw = base64::decode_config(token, base64::URL_SAFE_NO_PAD)
            .map_err(|_| VerifyError::Malformed)?;
        if raw.len() <= MAC_LEN {
            return Err(VerifyError::Malformed);
        }
        let (payload, tag) = raw.split_at(raw.len() - MAC_LEN);

        // Every accepted key is tried unconditionally, so verification time
        // does not depend on which key matches.
        let mut signature_ok = false;
        for key in self.keys.accepted() {
            signature_ok |= mac_matches(key, payload, tag);
        }
        if !signature_ok {
            return Err(VerifyError::SignatureInvalid);
        }

        let binding: TokenBinding =
            serde_json::from_slice(payload).map_err(|_| VerifyError::Malformed)?;
        if now_ms >= binding.expires_at_ms {
            return Err(VerifyError::Expired);
        }
        if binding.device_id != presented_device_id {
            return Err(VerifyError::DeviceMismatch);
        }
        Ok(binding)
    }

    /// Full verification including the revocation set. Revocation is the last
    /// check; a revoked id only rejects while the binding is still unexpired,
    /// matching the revocation set's own expiry.
    pub async fn verify_presented(
        &self,
        store: &dyn Store,
        token: &str,
        presented_device_id: &str,
        now_ms: u64,
    ) -> Result<TokenBinding, VerifyError> {
        let binding = self.verify(token, presented_device_id, now_ms)?;
        if store.is_revoked(&binding.queue_id, now_ms).await? {
            return Err(VerifyError::Revoked);
        }
        Ok(binding)
    }
}

fn mac_bytes(key: &[u8], payload: &[u8]) -> Option<[u8; MAC_LEN]> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(payload);
    Some(mac.finalize().into_bytes().into())
}

fn mac_matches(key: &[u8], payload: &[u8], tag: &[u8]) -> bool {
    HmacSha256::new_from_slice(key)
        .map(|mut mac| {
            mac.update(payload);
            // Constant-time comparison.
            mac.verify_slice(tag).is_ok()
        })
        .unwrap_or(false)
}
