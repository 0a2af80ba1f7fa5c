//! HMAC-chained API keys.
//!
//! An [`ApiKey`] is a head (identity), a list of caveats, and a tail. The tail
//! of a freshly minted key is `HMAC(secret, head)`; every restriction appends
//! a caveat and replaces the tail with `HMAC(tail, caveat)`. Anyone holding a
//! key can restrict it further, but only the holder of the root secret can
//! verify it, and caveats cannot be removed without breaking the chain.

use std::fmt;

use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, KeyInit, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::caveat::{Action, Caveat};
use crate::error::{AccessError, AccessResult};

type HmacSha256 = Hmac<Sha256>;

/// A project API key, possibly restricted by caveats.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey {
    head: Vec<u8>,
    caveats: Vec<Caveat>,
    tail: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct EncodedApiKey {
    head: String,
    #[serde(default)]
    caveats: Vec<Caveat>,
    tail: String,
}

impl ApiKey {
    /// Mint a new unrestricted key signed by `secret`.
    #[must_use]
    pub fn mint(secret: &[u8]) -> Self {
        let head = Uuid::new_v4().as_bytes().to_vec();
        let tail = sign(secret, &head);
        Self {
            head,
            caveats: Vec::new(),
            tail,
        }
    }

    /// Parse a serialized key.
    pub fn parse(encoded: &str) -> AccessResult<Self> {
        let raw = BASE64_URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| AccessError::InvalidApiKey(e.to_string()))?;
        let decoded: EncodedApiKey =
            serde_json::from_slice(&raw).map_err(|e| AccessError::InvalidApiKey(e.to_string()))?;
        let head =
            hex::decode(decoded.head).map_err(|e| AccessError::InvalidApiKey(e.to_string()))?;
        let tail =
            hex::decode(decoded.tail).map_err(|e| AccessError::InvalidApiKey(e.to_string()))?;
        if head.is_empty() || tail.is_empty() {
            return Err(AccessError::InvalidApiKey("empty head or tail".to_owned()));
        }
        Ok(Self {
            head,
            caveats: decoded.caveats,
            tail,
        })
    }

    /// Serialize the key to its URL-safe string form.
    #[must_use]
    pub fn serialize(&self) -> String {
        let encoded = EncodedApiKey {
            head: hex::encode(&self.head),
            caveats: self.caveats.clone(),
            tail: hex::encode(&self.tail),
        };
        // Serializing plain strings and caveats into a Vec cannot fail.
        let json = serde_json::to_vec(&encoded).unwrap_or_default();
        BASE64_URL_SAFE_NO_PAD.encode(json)
    }

    /// Return a copy of this key with `caveat` appended.
    pub fn restrict(&self, caveat: Caveat) -> AccessResult<Self> {
        let payload = serde_json::to_vec(&caveat)
            .map_err(|e| AccessError::DerivationFailed(e.to_string()))?;
        let tail = sign(&self.tail, &payload);
        let mut caveats = self.caveats.clone();
        caveats.push(caveat);
        Ok(Self {
            head: self.head.clone(),
            caveats,
            tail,
        })
    }

    /// Verify the caveat chain against the root secret.
    #[must_use]
    pub fn verify(&self, secret: &[u8]) -> bool {
        let mut tail = sign(secret, &self.head);
        for caveat in &self.caveats {
            let Ok(payload) = serde_json::to_vec(caveat) else {
                return false;
            };
            tail = sign(&tail, &payload);
        }
        tail == self.tail
    }

    /// Whether every caveat permits `action` on `bucket` at `now`.
    #[must_use]
    pub fn allows(&self, action: Action, bucket: &str, now: DateTime<Utc>) -> bool {
        self.caveats.iter().all(|c| c.allows(action, bucket, now))
    }

    /// The key identity, shared by every restriction of the same root key.
    #[must_use]
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    /// Caveats attached so far, oldest first.
    #[must_use]
    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("head", &hex::encode(&self.head))
            .field("caveats", &self.caveats.len())
            .finish_non_exhaustive()
    }
}

fn sign(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can accept keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    const SECRET: &[u8] = b"satellite-root-secret";

    #[test]
    fn test_should_mint_verifiable_key() {
        let key = ApiKey::mint(SECRET);
        assert!(key.verify(SECRET));
        assert!(!key.verify(b"other-secret"));
        assert!(key.caveats().is_empty());
    }

    #[test]
    fn test_should_roundtrip_serialized_key() {
        let key = ApiKey::mint(SECRET)
            .restrict(Caveat::full_access(Utc::now() + Duration::days(3)))
            .unwrap();
        let parsed = ApiKey::parse(&key.serialize()).unwrap();
        assert_eq!(parsed, key);
        assert!(parsed.verify(SECRET));
    }

    #[test]
    fn test_should_keep_chain_valid_after_restrict() {
        let now = Utc::now();
        let root = ApiKey::mint(SECRET);
        let mut caveat = Caveat::full_access(now + Duration::days(1));
        caveat.allow_upload = false;
        let restricted = root.restrict(caveat).unwrap();

        assert!(restricted.verify(SECRET));
        assert_eq!(restricted.head(), root.head());
        assert!(root.allows(Action::Write, "b", now));
        assert!(!restricted.allows(Action::Write, "b", now));
        assert!(restricted.allows(Action::Read, "b", now));
    }

    #[test]
    fn test_should_break_chain_when_caveat_removed() {
        let root = ApiKey::mint(SECRET);
        let restricted = root
            .restrict(Caveat::full_access(Utc::now() + Duration::days(1)))
            .unwrap();
        let forged = ApiKey {
            head: restricted.head.clone(),
            caveats: Vec::new(),
            tail: restricted.tail.clone(),
        };
        assert!(!forged.verify(SECRET));
    }

    #[test]
    fn test_should_reject_malformed_key() {
        assert!(matches!(
            ApiKey::parse("%%%"),
            Err(AccessError::InvalidApiKey(_))
        ));
        let not_json = BASE64_URL_SAFE_NO_PAD.encode(b"nope");
        assert!(ApiKey::parse(&not_json).is_err());
    }

    #[test]
    fn test_should_not_print_tail_in_debug() {
        let key = ApiKey::mint(SECRET);
        let printed = format!("{key:?}");
        assert!(!printed.contains(&hex::encode(&key.tail)));
    }
}
