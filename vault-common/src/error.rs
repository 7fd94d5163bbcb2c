//! Error types for the vault workflow engine.
//!
//! The variants double as the failure taxonomy that every loop and handler
//! reasons about: some are fatal, some are expected races, some are retried.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using the vault error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for vault services.
#[derive(Error, Debug)]
pub enum Error {
    /// A path resolved outside the configured vault root
    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    /// Another worker moved the record first
    #[error("Already claimed: {}", .0.display())]
    AlreadyClaimed(PathBuf),

    /// Network or rate-limit class failure of an external dependency
    #[error("Retryable failure from {dependency}: {message}")]
    Retryable { dependency: String, message: String },

    /// Failure of an external dependency that retrying will not fix
    #[error("Fatal failure from {dependency}: {message}")]
    Fatal { dependency: String, message: String },

    /// The breaker for a dependency rejected the call without attempting it
    #[error("Circuit open for {dependency}")]
    CircuitOpen { dependency: String },

    /// An external call exceeded its time budget
    #[error("Call to {dependency} timed out after {after:?}")]
    Timeout { dependency: String, after: Duration },

    /// Record header could not be parsed
    #[error("Corrupt record {}: {reason}", path.display())]
    CorruptRecord { path: PathBuf, reason: String },

    /// Approval window elapsed
    #[error("Approval expired for {0}")]
    ExpiredApproval(String),

    /// A record lacks a field its executor needs
    #[error("Record {record} is missing required field '{field}'")]
    MissingField { record: String, field: String },

    /// Transition not allowed by the lifecycle graph
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Destination already holds a file with the same name
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

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

    /// Shorthand for a retryable dependency failure.
    pub fn retryable(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retryable {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a fatal dependency failure.
    pub fn fatal(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// The innermost error, skipping context wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the resilience layer may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), Self::Retryable { .. } | Self::Timeout { .. })
    }

    /// Check if this is the expected "someone else moved it" outcome.
    pub fn is_already_claimed(&self) -> bool {
        matches!(self.root(), Self::AlreadyClaimed(_))
    }

    /// Check if this is a breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root(), Self::CircuitOpen { .. })
    }

    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PathTraversal(_)
            | Self::InvalidInput(_)
            | Self::MissingField { .. }
            | Self::InvalidTransition { .. } => 400,
            Self::Auth(_) => 401,
            Self::NotFound(_) => 404,
            Self::AlreadyClaimed(_) | Self::Conflict(_) => 409,
            Self::ExpiredApproval(_) => 410,
            Self::CorruptRecord { .. } => 422,
            Self::CircuitOpen { .. } => 503,
            Self::Timeout { .. } => 504,
            Self::Retryable { .. } | Self::Fatal { .. } => 502,
            Self::WithContext { source, .. } => source.status_code(),
            _ => 500,
        }
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}
