//! Caveats restrict what a derived key may do and when.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AccessError, AccessResult};

/// An operation class a caveat can allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Reading object data (get-object, retention and legal-hold reads).
    Read,
    /// Writing object data (put, multipart, copy, retention writes).
    Write,
    /// Listing objects and versions.
    List,
    /// Deleting objects and versions.
    Delete,
}

/// A restriction set attached to an API key.
///
/// Every caveat on a key must allow an action for the action to be permitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caveat {
    /// Allow reading object data.
    pub allow_download: bool,
    /// Allow writing object data.
    pub allow_upload: bool,
    /// Allow listing.
    pub allow_list: bool,
    /// Allow deletion.
    pub allow_delete: bool,
    /// Start of the validity window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// End of the validity window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    /// Buckets the key is limited to. Empty means every bucket.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<String>,
}

impl Caveat {
    /// A caveat allowing every action until `not_after`.
    #[must_use]
    pub fn full_access(not_after: DateTime<Utc>) -> Self {
        Self {
            allow_download: true,
            allow_upload: true,
            allow_list: true,
            allow_delete: true,
            not_before: None,
            not_after: Some(not_after),
            buckets: Vec::new(),
        }
    }

    /// Check that the caveat can be attached at time `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> AccessResult<()> {
        if !(self.allow_download || self.allow_upload || self.allow_list || self.allow_delete) {
            return Err(AccessError::DerivationFailed(
                "caveat grants no permissions".to_owned(),
            ));
        }
        if let Some(not_after) = self.not_after {
            if not_after <= now {
                return Err(AccessError::DerivationFailed(format!(
                    "caveat expired at {not_after}"
                )));
            }
            if let Some(not_before) = self.not_before {
                if not_before >= not_after {
                    return Err(AccessError::DerivationFailed(
                        "caveat notBefore must precede notAfter".to_owned(),
                    ));
                }
            }
        }
        if self.buckets.iter().any(String::is_empty) {
            return Err(AccessError::DerivationFailed(
                "caveat bucket names must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Whether this caveat permits `action` on `bucket` at `now`.
    #[must_use]
    pub fn allows(&self, action: Action, bucket: &str, now: DateTime<Utc>) -> bool {
        let permitted = match action {
            Action::Read => self.allow_download,
            Action::Write => self.allow_upload,
            Action::List => self.allow_list,
            Action::Delete => self.allow_delete,
        };
        if !permitted {
            return false;
        }
        if self.not_before.is_some_and(|t| now < t) || self.not_after.is_some_and(|t| now >= t) {
            return false;
        }
        self.buckets.is_empty() || self.buckets.iter().any(|b| b == bucket)
    }
}
