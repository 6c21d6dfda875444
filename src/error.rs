//! Error types for Shopgate.

use thiserror::Error;

/// Main error type for Shopgate operations.
#[derive(Error, Debug)]
pub enum ShopgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A resolved rate limit policy violates its bounds
    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    /// Whitelist pattern failed to compile
    #[error("Invalid whitelist pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Job batcher errors
    #[error("Batcher error: {0}")]
    Batcher(#[from] crate::batcher::BatcherError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for ShopgateError {
    fn from(err: ::config::ConfigError) -> Self {
        ShopgateError::Config(err.to_string())
    }
}

/// Result type alias for Shopgate operations.
pub type Result<T> = std::result::Result<T, ShopgateError>;
