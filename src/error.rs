//! Exchange adapter error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("auth error: {0}")]
    Auth(String),
    /// The exchange answered with a business error code
    #[error("exchange error {code}: {message}")]
    Exchange { code: String, message: String },
    #[error("parse error: {0}")]
    Decode(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    /// Errors worth another attempt with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout | Self::RateLimited
        )
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;
