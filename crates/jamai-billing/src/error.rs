//! Error types for jamai-billing

use thiserror::Error;

/// Billing error type
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown organization
    #[error("organization not found: {0}")]
    OrgNotFound(String),

    /// Unknown project
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// Quota / credit gate failure; the message names the model
    #[error("insufficient credits to use model: {0}")]
    InsufficientCredits(String),

    /// Malformed input
    #[error("bad input: {0}")]
    BadInput(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
