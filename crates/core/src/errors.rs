//! Error types shared across the mailhaven crates.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Database-layer failures surfaced to callers.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    #[error("{0}")]
    Internal(String),
}

/// Validation failures for user-supplied or wire data.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Missing field: {0}")]
    MissingField(String),
}

/// Top-level error for core and storage operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Secret store error: {0}")]
    SecretStore(String),

    #[error("{0}")]
    Unexpected(String),
}
