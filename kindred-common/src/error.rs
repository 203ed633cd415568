//! Common error types for Kindred

use thiserror::Error;

/// Common result type for Kindred operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the Kindred crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input or stored value
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
