//! Error types

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wrong master password (key-check token failed to decrypt)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed input to a create/update operation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation referenced a nonexistent record
    #[error("Not found: {0}")]
    NotFound(String),

    /// Encryption/decryption failure (authentication-tag mismatch, bad frame)
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Schema migration failure
    #[error("Migration error: {0}")]
    Migration(String),

    /// Underlying storage failure (I/O, locked file)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
