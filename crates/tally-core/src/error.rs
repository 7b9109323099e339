//! Error types and result aliases for tally-core.

/// The result type used throughout tally-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in core primitive operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A document identifier could not be parsed.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the identifier invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new invalid-identifier error.
    #[must_use]
    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId {
            message: message.into(),
        }
    }
}
