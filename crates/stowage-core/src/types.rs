//! Identifier and secret newtypes shared across crates.

use std::fmt;

use base64::{Engine, prelude::BASE64_STANDARD};
use uuid::Uuid;

use crate::{CoreError, CoreResult};

/// Console project identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProjectId(Uuid);

impl ProjectId {
    /// Parse a project ID from its hyphenated UUID form.
    ///
    /// # Errors
    /// Returns an error if the input is not a UUID.
    pub fn parse(id: &str) -> CoreResult<Self> {
        Uuid::parse_str(id)
            .map(Self)
            .map_err(|_| CoreError::InvalidProjectId(id.to_owned()))
    }

    /// Generate a random project ID.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ProjectId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Encryption passphrase supplied by the user.
///
/// The passphrase is never printed: `Debug` redacts it and there is no
/// `Display` impl.
#[derive(Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Passphrase(String);

impl Passphrase {
    /// Wrap a passphrase.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the raw passphrase for key derivation.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the passphrase is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Per-project salt, kept in the base64 form the console returns.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Salt(String);

impl Salt {
    /// Wrap a base64-encoded salt.
    #[must_use]
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Build a salt from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(BASE64_STANDARD.encode(bytes))
    }

    /// The base64 form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the salt bytes.
    ///
    /// # Errors
    /// Returns an error if the salt is not valid base64.
    pub fn decode(&self) -> CoreResult<Vec<u8>> {
        BASE64_STANDARD
            .decode(&self.0)
            .map_err(|e| CoreError::InvalidSalt(e.to_string()))
    }
}
