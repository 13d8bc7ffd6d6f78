/// Errors that can occur within the snapshot store.
///
/// # Examples
///
/// ```rust
/// use machinemon_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     entity: "provider",
///     id: "42".to_string(),
/// };
/// assert!(err.to_string().contains("provider"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found in the database.
    #[error("Storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    /// A scoped mute rule was rejected before touching the database.
    #[error("Storage: invalid mute rule: {0}")]
    InvalidMute(String),

    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failure (interface_ips column).
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Failed to create the data directory.
    #[error("Storage: I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
