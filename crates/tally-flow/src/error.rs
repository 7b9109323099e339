//! Error types for the reduce-pipeline domain.
//!
//! Errors carry the metadata the surrounding layers route on: an HTTP-ish
//! status for the router mapping, a `noretry` flag honored by the retry
//! middleware, and a `nobreaker` flag honored by the circuit breaker.

use serde_json::Value;

/// The result type used throughout tally-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Milliseconds in one month (the error-query window limit).
pub const MONTH_MS: i64 = 2_629_746_000;

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The input was previously processed; its effect is already durable.
    #[error("duplicate input: {id}")]
    Duplicate {
        /// The canonical input id.
        id: String,
    },

    /// The store rejected a conditional write (revision mismatch).
    #[error("conflict writing {id}")]
    Conflict {
        /// The document id that conflicted.
        id: String,
    },

    /// The requested document does not exist.
    #[error("not found: {id}")]
    NotFound {
        /// The document id that was looked up.
        id: String,
    },

    /// One or more sink posts failed.
    #[error("sink rejected {} output(s)", reasons.len())]
    Sink {
        /// Per-post failure bodies: `{id, status, ...body}`.
        reasons: Vec<Value>,
    },

    /// The user reducer returned an error.
    #[error("reducer failed: {message}")]
    Reducer {
        /// Description of the reducer failure.
        message: String,
    },

    /// The reducer flagged an output with an `error` mark.
    #[error("reducer flagged output: {error}")]
    Marked {
        /// The `error` value from the reducer output.
        error: Value,
        /// The `reason` value, when present.
        reason: Option<Value>,
    },

    /// A metering expression inside the reducer failed to evaluate.
    #[error("expression error: {message}")]
    Expression {
        /// Description of the expression failure.
        message: String,
    },

    /// An operation timed out.
    #[error("timeout: {message}")]
    Timeout {
        /// Description of the timed-out operation.
        message: String,
    },

    /// The error-list query window exceeds one month.
    #[error("error query window of {window_ms}ms exceeds one month")]
    WindowLimit {
        /// The requested window in milliseconds.
        window_ms: i64,
    },

    /// The circuit breaker is open for a target.
    #[error("circuit open for {target}")]
    BreakerOpen {
        /// The protected target.
        target: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An HTTP transport failure talking to the sink.
    #[error("sink transport error: {message}")]
    Http {
        /// Description of the transport failure.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Required configuration is missing.
    #[error("{0}")]
    MissingConfig(String),

    /// An error from tally-core.
    #[error("core error: {0}")]
    Core(#[from] tally_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Builds the error for a reducer output carrying an `{error}` mark.
    ///
    /// Nested marks may declare their kind via a `type` field:
    /// `"expression"` maps to [`Error::Expression`], `"timeout"` to
    /// [`Error::Timeout`]; anything else stays a [`Error::Marked`].
    #[must_use]
    pub fn from_reducer_mark(error: &Value, reason: Option<&Value>) -> Self {
        if let Some(kind) = error.get("type").and_then(Value::as_str) {
            match kind {
                "expression" => {
                    return Self::Expression {
                        message: error.to_string(),
                    };
                }
                "timeout" => {
                    return Self::Timeout {
                        message: error.to_string(),
                    };
                }
                _ => {}
            }
        }
        Self::Marked {
            error: error.clone(),
            reason: reason.cloned(),
        }
    }

    /// The HTTP status the router should map this error to.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Duplicate { .. } | Self::Conflict { .. } | Self::WindowLimit { .. } => 409,
            Self::NotFound { .. } => 404,
            Self::Expression { .. } => 422,
            Self::InvalidInput(_) | Self::MissingConfig(_) | Self::Core(_) => 400,
            Self::BreakerOpen { .. } => 503,
            Self::Http { .. } => 502,
            Self::Sink { reasons } => reasons
                .first()
                .and_then(|r| r.get("status"))
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or(500),
            Self::Marked { error, .. } => error
                .get("status")
                .or_else(|| error.get("statusCode"))
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or(500),
            Self::Reducer { .. }
            | Self::Timeout { .. }
            | Self::Storage { .. }
            | Self::Serialization { .. } => 500,
        }
    }

    /// The wire label for this error (`conflict`, `esink`, `errlimit`, ...).
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Duplicate { .. } | Self::Conflict { .. } => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::Sink { .. } => "esink",
            Self::WindowLimit { .. } => "errlimit",
            Self::Reducer { .. } | Self::Marked { .. } => "ereduce",
            Self::Expression { .. } => "expression",
            Self::Timeout { .. } => "timeout",
            Self::BreakerOpen { .. } => "ebreaker",
            Self::Http { .. } => "ehttp",
            Self::Storage { .. } => "estore",
            Self::Serialization { .. } => "eserial",
            Self::InvalidInput(_) | Self::MissingConfig(_) | Self::Core(_) => "einval",
        }
    }

    /// Whether retry middleware must not re-attempt the failed call.
    #[must_use]
    pub fn is_noretry(&self) -> bool {
        matches!(
            self,
            Self::Duplicate { .. }
                | Self::Conflict { .. }
                | Self::NotFound { .. }
                | Self::WindowLimit { .. }
                | Self::Marked { .. }
                | Self::Expression { .. }
                | Self::InvalidInput(_)
                | Self::MissingConfig(_)
                | Self::Core(_)
        )
    }

    /// Whether the circuit breaker must not count this error as a failure.
    #[must_use]
    pub fn is_nobreaker(&self) -> bool {
        self.is_noretry()
    }
}
