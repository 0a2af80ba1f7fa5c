//! Error types for access derivation.
//!
//! Every failure on the way from a project API key to gateway credentials is
//! represented by [`AccessError`].

use stowage_core::CoreError;

/// Errors produced while deriving or exchanging access.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// The capability worker has not been started or set up, or its thread exited.
    #[error("capability worker is unavailable")]
    WorkerUnavailable,

    /// The capability worker failed to initialize.
    #[error("capability worker setup failed: {0}")]
    SetupFailed(String),

    /// A restricted grant or access string could not be derived.
    #[error("access derivation failed: {0}")]
    DerivationFailed(String),

    /// A serialized API key could not be parsed.
    #[error("invalid API key: {0}")]
    InvalidApiKey(String),

    /// A serialized access string could not be parsed.
    #[error("invalid access grant: {0}")]
    InvalidAccessGrant(String),

    /// The gateway credential service rejected or failed the exchange.
    #[error("credential exchange failed: {message}")]
    ExchangeFailed {
        /// HTTP status code, when a response was received.
        status: Option<u16>,
        /// Transport error or response body.
        message: String,
    },

    /// The console project API failed.
    #[error("project API error: {message}")]
    Project {
        /// HTTP status code, when a response was received.
        status: Option<u16>,
        /// Transport error or response body.
        message: String,
    },

    /// Core error.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Convenience result type for access operations.
pub type AccessResult<T> = Result<T, AccessError>;
