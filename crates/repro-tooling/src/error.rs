//! Error types for repro-tooling

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving external tools
#[derive(Error, Debug)]
pub enum ToolError {
    /// Program not present in PATH
    #[error("'{0}' is required but was not found in PATH")]
    NotFound(String),

    /// The child process could not be started
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The child exited with a non-zero status
    #[error("{context} (exit code {code}){}", detail_suffix(.detail))]
    Failed {
        context: String,
        code: i32,
        detail: String,
    },

    /// The child did not finish within its deadline
    #[error("'{program}' timed out after {}s", .limit.as_secs())]
    Timeout { program: String, limit: Duration },

    /// Command had no program
    #[error("empty command")]
    EmptyCommand,

    /// Manifest could not be parsed or failed validation
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Ref string could not be parsed
    #[error("invalid flatpak ref: {0}")]
    InvalidRef(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ToolError {
    /// Whether this error is a deadline expiry rather than a tool failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout { .. })
    }
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}
