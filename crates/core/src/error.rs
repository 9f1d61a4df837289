//! Core error types

use thiserror::Error;

/// Core error type for the credibility mesh
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed configuration or policy document
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parse error
    #[cfg(feature = "toml")]
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
