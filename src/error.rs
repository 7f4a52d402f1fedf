//! Error types for spotter operations.

use std::path::PathBuf;

/// Failures of the client-local key-value storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create storage directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures while reading or writing set history.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to create history directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("history row has malformed timestamp: {0}")]
    BadTimestamp(String),
}

/// Failures of the completion call to the server of record.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("completion rejected with status {0}")]
    Status(u16),

    #[error("session {0} is not completed")]
    NotCompleted(String),

    #[error("completion for session {0} is still in flight")]
    Busy(String),

    #[error("completion worker exited without reporting")]
    Disconnected,
}

/// Fault raised by the session editor while running under the recovery supervisor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EditorFault {
    #[error("{0}")]
    Failed(String),

    #[error("editor panicked: {0}")]
    Panicked(String),

    #[error("a captured fault is awaiting recover, retry, or discard")]
    Unresolved,
}

/// Errors surfaced by the command-line front end.
#[derive(Debug, thiserror::Error)]
pub enum SpotterError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Editor(#[from] EditorFault),

    #[error("no workout session in progress")]
    NoActiveSession,

    #[error("could not resolve a data directory; pass --data-dir")]
    NoDataDir,

    #[error("{0}")]
    Rejected(String),
}
