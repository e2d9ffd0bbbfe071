use std::path::PathBuf;

use thiserror::Error;

/// Main error type for fpindex operations
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("not a directory: {}", .0.display())]
    NotDirectory(PathBuf),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted {kind}: {reason}")]
    Corrupted { kind: &'static str, reason: String },

    #[error("directory is locked by another process")]
    Locked,

    #[error("database is already closed")]
    AlreadyClosed,

    #[error("commit conflict")]
    CommitConflict,

    #[error("document id 0 is reserved")]
    InvalidDocId,

    #[error("document has no terms")]
    EmptyTerms,
}

/// Result type alias for fpindex operations
pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    pub(crate) fn corrupted(kind: &'static str, reason: impl Into<String>) -> Self {
        IndexError::Corrupted {
            kind,
            reason: reason.into(),
        }
    }

    /// Check if this error indicates a transient conflict that is resolved
    /// internally by retrying or abandoning the operation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, IndexError::CommitConflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexError::corrupted("manifest", "bad magic");
        assert_eq!(err.to_string(), "corrupted manifest: bad magic");
        assert_eq!(
            IndexError::AlreadyClosed.to_string(),
            "database is already closed"
        );
    }

    #[test]
    fn test_conflict_classification() {
        assert!(IndexError::CommitConflict.is_conflict());
        assert!(!IndexError::Locked.is_conflict());
    }
}
