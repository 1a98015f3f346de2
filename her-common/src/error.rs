//! Error types shared by the her services.

use thiserror::Error;

/// Result type alias using the her error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for her services.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Credentials rejected by a backing service
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A backing service could not be reached
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// External service error
    #[error("External service error: {0}")]
    External(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Auth(_) => 401,
            Self::InvalidInput(_) => 400,
            Self::Unavailable(_) => 503,
            Self::External(_) => 502,
            Self::WithContext { source, .. } => source.status_code(),
            _ => 500,
        }
    }

    /// Short machine-readable code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Auth(_) => "auth_failed",
            Self::InvalidInput(_) => "invalid_input",
            Self::Unavailable(_) => "store_unavailable",
            Self::External(_) => "external_error",
            Self::WithContext { source, .. } => source.code(),
            _ => "internal_error",
        }
    }
}
