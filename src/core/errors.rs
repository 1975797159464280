//! Custom error types for imagery fetch operations

use thiserror::Error;

/// Fetch-related errors
#[derive(Error, Debug)]
pub enum FetchError {
    /// Metadata lookup found no imagery at this coordinate
    #[error("No imagery available at this location")]
    NoImageryAvailable,

    /// No credential in the pool is currently eligible
    #[error("All API keys exhausted")]
    AllKeysExhausted,

    /// Upstream rejected the request (quota or rate limit)
    #[error("Access denied by upstream: HTTP {status}")]
    AccessDenied {
        status: u16,
    },

    /// A single request failed for a non-denial reason
    #[error("Transient fetch failure: {message}")]
    TransientFetchFailure {
        message: String,
    },

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Invalid response from API
    #[error("Invalid response: {message}")]
    InvalidResponse {
        message: String,
    },

    /// Storage operation error
    #[error("Storage error: {path} - {message}")]
    StorageError {
        path: String,
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        message: String,
    },

    /// Wrapper for anyhow errors
    #[error("Internal error: {0}")]
    InternalError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Reqwest error
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl FetchError {
    /// Whether this error means the whole batch must stop
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, FetchError::AllKeysExhausted)
    }

    /// Whether the error is the expected "nothing here" outcome
    pub fn is_unavailable(&self) -> bool {
        matches!(self, FetchError::NoImageryAvailable)
    }

    /// Whether the orchestrator should count this against the batch failure counter
    pub fn counts_as_failure(&self) -> bool {
        !self.is_exhaustion()
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(err: anyhow::Error) -> Self {
        FetchError::InternalError(err.to_string())
    }
}

/// Result type for fetch operations
pub type Result<T> = std::result::Result<T, FetchError>;
