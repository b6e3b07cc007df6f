//! Fatal error taxonomy.
//!
//! Stage failures never surface here: they are converted to
//! [`ComparisonResult::Failed`](super::ComparisonResult::Failed) at the stage
//! boundary. `ReproError` covers the narrow class of errors that prevent a
//! result record from being produced at all.

use std::path::PathBuf;

/// Errors that abort a run without a result record.
#[derive(Debug, thiserror::Error)]
pub enum ReproError {
    #[error("environment error: {0}")]
    Environment(String),

    #[error("another instance is already running (lock held on {})", .0.display())]
    LockHeld(PathBuf),

    #[error("invalid application id '{id}': {reason}")]
    InvalidAppId { id: String, reason: String },

    #[error("failed to write result record: {0}")]
    RecordWrite(#[source] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReproError {
    /// Whether the error belongs to the `EnvironmentFailure` class.
    pub fn is_environment(&self) -> bool {
        matches!(self, ReproError::Environment(_) | ReproError::LockHeld(_))
    }
}

/// Result type for repro-core operations.
pub type Result<T> = std::result::Result<T, ReproError>;
