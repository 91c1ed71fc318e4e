//! Error types for jamai-llm

use thiserror::Error;

/// Serving layer error type
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or invalid request
    #[error("bad input: {0}")]
    BadInput(String),

    /// Unknown model, deployment or organization
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// The prompt does not fit the model's context window
    #[error("context length exceeded: {0}")]
    ContextOverflow(String),

    /// Provider rejected our credentials (401/403)
    #[error("provider authentication failed: {0}")]
    ProviderAuth(String),

    /// Provider rate limited the call (429)
    #[error("provider rate limited: {0}")]
    ProviderRateLimit(String),

    /// Provider 5xx, timeout or connection failure
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Every deployment of the model is cooling down or absent
    #[error("no available deployment for model: {0}")]
    NoAvailableDeployment(String),

    /// Provider returned a body we could not decode
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Transport-level failure while reading a response
    #[error("network error: {0}")]
    Network(String),

    /// Programmer error
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Whether the router may retry this error on another deployment.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderRateLimit(_) | Self::ProviderUnavailable(_) | Self::Network(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::ProviderRateLimit("429".into()).is_retryable());
        assert!(Error::ProviderUnavailable("503".into()).is_retryable());
        assert!(!Error::ProviderAuth("401".into()).is_retryable());
        assert!(!Error::ContextOverflow("too long".into()).is_retryable());
        assert!(!Error::BadInput("bad".into()).is_retryable());
    }
}
