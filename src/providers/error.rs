use std::fmt;

/// Errors surfaced by `HistoryStore` implementations.
///
/// `VersionConflict` is the optimistic-concurrency signal: the caller's
/// snapshot went stale, so it must re-read and recompute rather than retry
/// the same append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    VersionConflict { expected: u64, actual: u64 },
    InstanceAlreadyExists(String),
    InstanceNotFound(String),
    ExecutionNotFound { instance: String, execution_id: u64 },
    Io(String),
}

impl StoreError {
    /// Whether retrying the whole operation (after a fresh read for
    /// `VersionConflict`) can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. } | StoreError::Io(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::VersionConflict { expected, actual } => {
                write!(f, "version conflict: expected {expected}, actual {actual}")
            }
            StoreError::InstanceAlreadyExists(id) => write!(f, "instance already exists: {id}"),
            StoreError::InstanceNotFound(id) => write!(f, "instance not found: {id}"),
            StoreError::ExecutionNotFound { instance, execution_id } => {
                write!(f, "execution not found: {instance}#{execution_id}")
            }
            StoreError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
