//! Hub error types.

use thiserror::Error;

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Errors that can occur during hub operations.
///
/// Authorization failures are a distinct variant from not-found so callers
/// can report "not allowed" and "missing" differently.
#[derive(Debug, Error)]
pub enum HubError {
    /// The requested path or identity is outside the allowed sandbox.
    #[error("access denied: {0}")]
    Forbidden(String),

    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path exists but does not denote a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// An external tool failed to start or misbehaved.
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    /// An external tool exceeded its deadline.
    #[error("{tool} timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether this error should surface as an authorization failure.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }
}
