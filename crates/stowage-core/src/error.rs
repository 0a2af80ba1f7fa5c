//! Error types for the Stowage core.

/// Core error type for Stowage infrastructure.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Invalid project ID format.
    #[error("invalid project ID: {0} (must be a UUID)")]
    InvalidProjectId(String),

    /// Project salt is not valid base64.
    #[error("invalid project salt: {0}")]
    InvalidSalt(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error with context.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
