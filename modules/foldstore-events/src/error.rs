/// Result type alias for event log and backend operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Storage quota exceeded while writing {key}")]
    QuotaExceeded { key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Snapshot version {attempted} is older than the stored version {current}")]
    StaleSnapshot { current: u64, attempted: u64 },

    #[error("Log entries out of order: expected sequence {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },
}

impl StoreError {
    pub(crate) fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
