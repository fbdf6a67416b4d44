use thiserror::Error;

/// Errors that can occur within the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem fault while creating the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A TTL string did not match `<positive integer><d|h|m>`.
    #[error("Invalid TTL '{0}': expected <number><d|h|m>, e.g. \"90m\"")]
    InvalidTtl(String),

    /// A queue payload could not be serialized or deserialized.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
