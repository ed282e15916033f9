use thiserror::Error;

/// Errors produced while talking to the generation and health endpoints.
///
/// Payloads are kept as strings so errors can be cloned into shared
/// snapshots and handed to every waiter of a joined request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Status requested without a job id. Raised before any network IO.
    #[error("job id is required")]
    MissingJobId,

    /// Bearer token missing, expired or rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// Non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Connection or protocol failure before a response arrived.
    #[error("HTTP request failed: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    /// Response body did not match the expected shape.
    #[error("failed to parse response: {0}")]
    Decode(String),

    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// Background request task failed to complete.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Returns true if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

impl From<url::ParseError> for ApiError {
    fn from(e: url::ParseError) -> Self {
        ApiError::InvalidUrl(e.to_string())
    }
}

/// Errors raised while loading [`ClientConfig`](crate::config::ClientConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid API base URL {value:?}: {reason}")]
    InvalidUrl { value: String, reason: String },
}
