//! Browser error types.
//!
//! [`BrowserError`] is the single error type surfaced by sessions and engines.
//! Every variant is a distinct, inspectable failure kind; formatting for end
//! users happens above this crate.

use stowage_access::AccessError;

use crate::store::{DeleteFailure, StoreError};

/// Errors produced by the object browser core.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------
    /// The capability worker is not running or not set up.
    #[error("capability worker is unavailable")]
    WorkerUnavailable,

    /// The capability worker failed to initialize.
    #[error("capability worker setup failed: {0}")]
    SetupFailed(String),

    /// Restricted grant or access string derivation failed.
    #[error("access derivation failed: {0}")]
    DerivationFailed(String),

    /// A session was opened without an encryption passphrase.
    #[error("encryption passphrase must not be empty")]
    EmptyPassphrase,

    /// The gateway credential exchange failed.
    #[error("credential exchange failed: {message}")]
    ExchangeFailed {
        /// HTTP status, when a response was received.
        status: Option<u16>,
        /// Transport error or response body.
        message: String,
    },

    /// The console project API failed.
    #[error("project API error: {0}")]
    Project(String),

    /// An operation needed a client before one was built.
    #[error("object store client is not initialized")]
    UninitializedClient,

    // -----------------------------------------------------------------------
    // Upload
    // -----------------------------------------------------------------------
    /// An upload of the same key is still in progress.
    #[error("an upload of {key} is already in progress")]
    DuplicateUpload {
        /// The contested key.
        key: String,
    },

    /// The file exceeds the upload ceiling.
    #[error("{key} is {size} bytes, above the {limit} byte upload limit")]
    FileTooLarge {
        /// Object key.
        key: String,
        /// File size in bytes.
        size: u64,
        /// Configured ceiling in bytes.
        limit: u64,
    },

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------
    /// Some deletions failed; `deleted` objects were removed regardless.
    #[error("deleted {deleted} objects, {} failed: {}", .failures.len(), first_message(.failures))]
    ObjectDelete {
        /// Objects actually deleted.
        deleted: usize,
        /// Every failed deletion.
        failures: Vec<DeleteFailure>,
    },

    // -----------------------------------------------------------------------
    // Backend / generic
    // -----------------------------------------------------------------------
    /// An object store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid caller input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error with context.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BrowserError {
    /// Deleted count carried by an [`BrowserError::ObjectDelete`].
    #[must_use]
    pub fn deleted_count(&self) -> Option<usize> {
        match self {
            Self::ObjectDelete { deleted, .. } => Some(*deleted),
            _ => None,
        }
    }
}

fn first_message(failures: &[DeleteFailure]) -> &str {
    failures.first().map_or("", |f| f.message.as_str())
}

impl From<AccessError> for BrowserError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::WorkerUnavailable => Self::WorkerUnavailable,
            AccessError::SetupFailed(message) => Self::SetupFailed(message),
            AccessError::DerivationFailed(message)
            | AccessError::InvalidApiKey(message)
            | AccessError::InvalidAccessGrant(message) => Self::DerivationFailed(message),
            AccessError::ExchangeFailed { status, message } => {
                Self::ExchangeFailed { status, message }
            }
            AccessError::Project { status, message } => Self::Project(match status {
                Some(code) => format!("{code}: {message}"),
                None => message,
            }),
            AccessError::Core(e) => Self::Internal(e.into()),
        }
    }
}

/// Convenience result type for browser operations.
pub type BrowserResult<T> = Result<T, BrowserError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_map_access_errors_to_browser_kinds() {
        assert!(matches!(
            BrowserError::from(AccessError::WorkerUnavailable),
            BrowserError::WorkerUnavailable
        ));
        assert!(matches!(
            BrowserError::from(AccessError::InvalidApiKey("bad".into())),
            BrowserError::DerivationFailed(_)
        ));
        assert!(matches!(
            BrowserError::from(AccessError::ExchangeFailed {
                status: Some(403),
                message: "denied".into()
            }),
            BrowserError::ExchangeFailed {
                status: Some(403),
                ..
            }
        ));
    }

    #[test]
    fn test_should_format_delete_error_with_count() {
        let err = BrowserError::ObjectDelete {
            deleted: 7,
            failures: vec![DeleteFailure {
                key: "a".into(),
                version_id: None,
                code: Some("AccessDenied".into()),
                message: "Access Denied".into(),
            }],
        };
        assert_eq!(err.deleted_count(), Some(7));
        assert_eq!(err.to_string(), "deleted 7 objects, 1 failed: Access Denied");
    }
}
