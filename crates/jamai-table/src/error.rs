//! Error types for jamai-table

use thiserror::Error;

/// Table engine error type
#[derive(Debug, Error)]
pub enum Error {
    /// Schema violation, invalid template reference, dtype mismatch
    #[error("bad input: {0}")]
    BadInput(String),

    /// Unknown table, row, column or model
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Duplicate table or column
    #[error("resource exists: {0}")]
    ResourceExists(String),

    /// Storage failure
    #[error("database error: {0}")]
    Database(String),

    /// Serving layer failure
    #[error(transparent)]
    Llm(#[from] jamai_llm::Error),

    /// Billing gate or org lookup failure
    #[error(transparent)]
    Billing(#[from] jamai_billing::Error),

    /// Programmer error
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::ResourceNotFound("row".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
