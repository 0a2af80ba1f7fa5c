//! Access strings: an API key, a satellite address and an encryption key.

use std::fmt;

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use hmac::{Hmac, KeyInit, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use stowage_core::Passphrase;

use crate::api_key::ApiKey;
use crate::error::{AccessError, AccessResult};

/// Length of a derived encryption key in bytes.
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Root encryption key derived from a passphrase and a project salt.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; ENCRYPTION_KEY_LEN]);

impl EncryptionKey {
    /// Derive the key as `HMAC-SHA256(salt, passphrase)`.
    pub fn derive(passphrase: &Passphrase, salt: &[u8]) -> AccessResult<Self> {
        if passphrase.is_empty() {
            return Err(AccessError::DerivationFailed(
                "passphrase must not be empty".to_owned(),
            ));
        }
        let mut mac = Hmac::<Sha256>::new_from_slice(salt)
            .map_err(|e| AccessError::DerivationFailed(e.to_string()))?;
        mac.update(passphrase.expose().as_bytes());
        let digest = mac.finalize().into_bytes();
        let mut key = [0_u8; ENCRYPTION_KEY_LEN];
        key.copy_from_slice(&digest[..ENCRYPTION_KEY_LEN]);
        Ok(Self(key))
    }

    fn from_hex(encoded: &str) -> AccessResult<Self> {
        let raw =
            hex::decode(encoded).map_err(|e| AccessError::InvalidAccessGrant(e.to_string()))?;
        let key: [u8; ENCRYPTION_KEY_LEN] = raw.try_into().map_err(|_| {
            AccessError::InvalidAccessGrant("encryption key has wrong length".to_owned())
        })?;
        Ok(Self(key))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// A serialized-ready access grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    satellite_address: String,
    api_key: ApiKey,
    encryption_key: EncryptionKey,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncodedGrant {
    satellite_address: String,
    api_key: String,
    encryption_key: String,
}

impl AccessGrant {
    /// Assemble a grant.
    #[must_use]
    pub fn new(
        satellite_address: impl Into<String>,
        api_key: ApiKey,
        encryption_key: EncryptionKey,
    ) -> Self {
        Self {
            satellite_address: satellite_address.into(),
            api_key,
            encryption_key,
        }
    }

    /// Encode the grant as an access string.
    pub fn serialize(&self) -> AccessResult<String> {
        let encoded = EncodedGrant {
            satellite_address: self.satellite_address.clone(),
            api_key: self.api_key.serialize(),
            encryption_key: hex::encode(self.encryption_key.0),
        };
        let json = serde_json::to_vec(&encoded)
            .map_err(|e| AccessError::DerivationFailed(e.to_string()))?;
        Ok(BASE64_URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode an access string.
    pub fn parse(access: &str) -> AccessResult<Self> {
        let raw = BASE64_URL_SAFE_NO_PAD
            .decode(access.trim())
            .map_err(|e| AccessError::InvalidAccessGrant(e.to_string()))?;
        let decoded: EncodedGrant = serde_json::from_slice(&raw)
            .map_err(|e| AccessError::InvalidAccessGrant(e.to_string()))?;
        if decoded.satellite_address.is_empty() {
            return Err(AccessError::InvalidAccessGrant(
                "missing satellite address".to_owned(),
            ));
        }
        Ok(Self {
            satellite_address: decoded.satellite_address,
            api_key: ApiKey::parse(&decoded.api_key)?,
            encryption_key: EncryptionKey::from_hex(&decoded.encryption_key)?,
        })
    }

    /// Satellite the grant is valid for.
    #[must_use]
    pub fn satellite_address(&self) -> &str {
        &self.satellite_address
    }

    /// The (possibly restricted) API key.
    #[must_use]
    pub fn api_key(&self) -> &ApiKey {
        &self.api_key
    }

    /// The derived encryption key.
    #[must_use]
    pub fn encryption_key(&self) -> &EncryptionKey {
        &self.encryption_key
    }
}
