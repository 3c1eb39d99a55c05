//! Error types for the query framework.

use std::fmt;

/// Result type for engine and facade operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the query framework.
///
/// Application-level failures reported by an API envelope are never
/// represented here; they travel as [`FetchError::Api`](crate::envelope::FetchError)
/// with the caller's own error type. This enum covers usage errors and
/// transport-level failures.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// An adapter was used outside a [`QueryClient::provide`](crate::QueryClient::provide) scope.
    ///
    /// This is a programmer error. Wrap the calling future in a provider
    /// scope or use the explicit [`QueryClient::api`](crate::QueryClient::api) handle.
    NoProvider,

    /// Engine work had to be spawned but no tokio runtime was running.
    NoRuntime,

    /// Cached value under `key` has a different type than the one requested.
    ///
    /// Two call sites reading the same key must agree on its value type.
    TypeMismatch {
        /// Display form of the offending key
        key: String,
        /// Type name requested by the caller
        expected: &'static str,
    },

    /// The request future itself failed (network, serialization, ...).
    ///
    /// Request clients return this instead of an envelope when no
    /// well-formed response exists.
    Transport(String),

    /// A spawned fetch or mutation task panicked or was aborted.
    TaskFailed(String),

    /// Invalid client configuration.
    ConfigError(String),

    /// Generic error with custom message.
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoProvider => write!(f, "No query client provided in this scope"),
            Error::NoRuntime => write!(f, "No tokio runtime available"),
            Error::TypeMismatch { key, expected } => {
                write!(f, "Type mismatch for key {}: expected {}", key, expected)
            }
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::TaskFailed(msg) => write!(f, "Task failed: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() || e.is_eof() {
            Error::Transport(e.to_string())
        } else {
            Error::ConfigError(e.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::TaskFailed(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}
