//! Error types for ratewindow.

use thiserror::Error;

/// Main error type for rate limiting operations.
#[derive(Error, Debug)]
pub enum RateWindowError {
    /// Configuration-related errors, including non-positive limits
    #[error("Configuration error: {0}")]
    Config(String),

    /// The backing store is unreachable, closed, or answered with garbage
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Redis command errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Access to an empty (or full) local counting structure
    #[error("Invalid state access: {0}")]
    EmptyState(&'static str),
}

impl RateWindowError {
    /// Whether this error came from talking to an external store.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            RateWindowError::StoreUnavailable(_) | RateWindowError::Redis(_) | RateWindowError::Io(_)
        )
    }
}

impl From<config::ConfigError> for RateWindowError {
    fn from(err: config::ConfigError) -> Self {
        RateWindowError::Config(err.to_string())
    }
}

/// Result type alias for ratewindow operations.
pub type Result<T> = std::result::Result<T, RateWindowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_classification() {
        assert!(RateWindowError::StoreUnavailable("down".into()).is_store_failure());
        assert!(RateWindowError::Io(std::io::Error::other("reset")).is_store_failure());
        assert!(!RateWindowError::Config("bad".into()).is_store_failure());
        assert!(!RateWindowError::EmptyState("heap").is_store_failure());
    }
}
