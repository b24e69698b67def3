//! Error types for the tunnel launcher.
//!
//! Every error that crosses the public API is one of these variants, surfaced
//! exactly as the failing step produced it. Retry loops never wrap the last
//! error, so callers can keep matching on variants and message text.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the tunnel launcher.
#[derive(Debug, Error)]
pub enum LauncherError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        /// Full cause chain of the transport error, if any.
        cause: Option<String>,
    },

    #[error("Download failed with status code: {status}")]
    InvalidStatus { url: String, status: u16 },

    #[error("Archive checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    // Manifest resolution errors
    #[error("Failed to parse manifest: {message}")]
    Parse { message: String },

    #[error("No archive published for {what}")]
    NotFound { what: String },

    // Process errors
    #[error("Failed to spawn {}: {source}", .executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy exited before the tunnel was established (exit code {})", format_code(.code))]
    PrematureExit { code: Option<i32> },

    #[error("Proxy reported a fatal error: {line}")]
    FatalLog { line: String },

    #[error("Tunnel came up without reporting a tunnel id: {line}")]
    MissingTunnelId { line: String },

    #[error("Tunnel was not established within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Launch cancelled")]
    Cancelled,

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, LauncherError>;

fn format_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none, killed by signal".to_string(), |c| c.to_string())
}

impl From<std::io::Error> for LauncherError {
    fn from(err: std::io::Error) -> Self {
        LauncherError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LauncherError {
    fn from(err: serde_json::Error) -> Self {
        LauncherError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for LauncherError {
    fn from(err: reqwest::Error) -> Self {
        LauncherError::network("Request failed", &err)
    }
}

impl LauncherError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        LauncherError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a network error, flattening the cause chain into the message.
    ///
    /// reqwest's top-level display hides the OS-level reason ("Connection
    /// refused") several sources deep.
    pub fn network(context: &str, err: &(dyn std::error::Error + 'static)) -> Self {
        let chain = error_chain(err);
        LauncherError::Network {
            message: format!("{}: {}", context, chain),
            cause: Some(chain),
        }
    }

    /// Check if a failed attempt should be retried.
    ///
    /// Spawn failures are deterministic (the executable is missing or not
    /// runnable) and cancellation is caller-requested, so neither is retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            LauncherError::Spawn { .. } | LauncherError::Cancelled | LauncherError::Config { .. }
        )
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            LauncherError::InvalidStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Render an error and all of its sources as `outer: inner: innermost`.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(source) = current {
        let text = source.to_string();
        if !parts.iter().any(|p| p.contains(&text)) {
            parts.push(text);
        }
        current = source.source();
    }
    parts.join(": ")
}
