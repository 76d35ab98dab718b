use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata index error: {0}")]
    Database(String),

    #[error("Blob store error: {0}")]
    Blob(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Source bytes no longer hash to the content being uploaded.
    #[error("Source {path} changed: expected {expected}, read {actual}")]
    SourceChanged {
        path: String,
        expected: String,
        actual: String,
    },

    /// The file was still being written while it was read.
    #[error("File changed while reading: {0}")]
    Unstable(String),

    /// Upload succeeded, the metadata commit failed, and the blob was removed.
    #[error("Upload of {key} rolled back: {source}")]
    Compensated {
        key: String,
        #[source]
        source: Box<SyncError>,
    },

    /// Upload succeeded, the metadata commit failed, and so did the cleanup.
    #[error("Upload of {key} left an orphan blob: commit failed ({commit}); cleanup failed ({cleanup})")]
    CompensationFailed {
        key: String,
        commit: Box<SyncError>,
        cleanup: Box<SyncError>,
    },

    /// Another worker took over the upload claim for this content.
    #[error("Upload claim lost: {0}")]
    ClaimLost(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the failure is expected to clear up on the next watch or scan
    /// cycle without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Io(_)
                | SyncError::Database(_)
                | SyncError::Blob(_)
                | SyncError::SourceChanged { .. }
                | SyncError::Unstable(_)
                | SyncError::Compensated { .. }
        )
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
