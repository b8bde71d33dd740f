use std::path::PathBuf;

/// Errors raised by the work store.
///
/// Categories:
/// - Retryable: database busy/locked, the next poll will try again
/// - Fatal: the store cannot be opened or its rows cannot be decoded
/// - Skip: the item vanished, log and continue
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    // Fatal
    #[error("Failed to open store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    // Retryable or fatal depending on the SQLite code
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // Skip
    #[error("Item not found: {0}")]
    ItemNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal panic in storage thread: {0}")]
    Internal(String),
}

impl StoreError {
    /// Returns true if the error is transient contention on the database file.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Returns true if the store is unusable and the caller should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Open { .. } | StoreError::Corrupt(_) | StoreError::Internal(_)
        )
    }
}

impl From<StoreError> for String {
    fn from(err: StoreError) -> String {
        err.to_string()
    }
}
