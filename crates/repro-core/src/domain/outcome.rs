//! Pipeline outcomes and their status-code classification.

use std::fmt;
use std::path::{Path, PathBuf};

use repro_tooling::{RefKind, ToolError};
use serde::{Deserialize, Serialize};

/// Pipeline stage that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Resolve,
    Build,
    Compare,
    Upload,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Build => "build",
            Stage::Compare => "compare",
            Stage::Upload => "upload",
        }
    }

    /// Map a tool error raised inside this stage to its failure cause.
    /// Deadline expiry is always [`FailureCause::Timeout`].
    pub fn cause(&self, err: ToolError) -> FailureCause {
        let message = err.to_string();
        if err.is_timeout() {
            return FailureCause::Timeout(message);
        }
        match self {
            Stage::Resolve => FailureCause::ResolveFailure(message),
            Stage::Build => FailureCause::BuildFailure(message),
            Stage::Compare => FailureCause::CompareToolFailure(message),
            Stage::Upload => FailureCause::UploadFailure(message),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureCause {
    /// The target is a runtime or extension, not an application.
    #[error("Unsupported ref kind '{kind}' for '{id}': only app refs can be checked")]
    UnsupportedRefKind { id: String, kind: RefKind },

    /// Network, remote or not-found errors while fetching the reference.
    #[error("{0}")]
    ResolveFailure(String),

    /// Dependency setup or the build tool failed.
    #[error("{0}")]
    BuildFailure(String),

    /// The diffing engine could not be run, as opposed to finding a mismatch.
    #[error("{0}")]
    CompareToolFailure(String),

    /// An external command exceeded its deadline.
    #[error("{0}")]
    Timeout(String),

    /// Result upload failed and uploads were requested to be strict.
    #[error("{0}")]
    UploadFailure(String),
}

/// On-disk diffoscope HTML report of an unreproducible build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    dir: PathBuf,
}

impl DiffReport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Terminal outcome of one run. Exactly one is produced per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonResult {
    Reproducible,
    Unreproducible(DiffReport),
    Failed { stage: Stage, cause: FailureCause },
}

impl ComparisonResult {
    pub fn failed(stage: Stage, cause: FailureCause) -> Self {
        ComparisonResult::Failed { stage, cause }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ComparisonResult::Reproducible => StatusCode::Success,
            ComparisonResult::Unreproducible(_) => StatusCode::Unreproducible,
            ComparisonResult::Failed { .. } => StatusCode::Failure,
        }
    }

    /// Human-readable summary used as the record message.
    pub fn message(&self) -> String {
        match self {
            ComparisonResult::Reproducible => "Success".to_string(),
            ComparisonResult::Unreproducible(_) => "Unreproducible".to_string(),
            ComparisonResult::Failed { cause, .. } => cause.to_string(),
        }
    }

    pub fn diff_report(&self) -> Option<&DiffReport> {
        match self {
            ComparisonResult::Unreproducible(report) => Some(report),
            _ => None,
        }
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            ComparisonResult::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Status taxonomy shared by the result record and the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success = 0,
    Failure = 1,
    Unreproducible = 42,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Success => "0",
            StatusCode::Failure => "1",
            StatusCode::Unreproducible => "42",
        }
    }

    pub fn exit_code(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i32> for StatusCode {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(StatusCode::Success),
            1 => Ok(StatusCode::Failure),
            42 => Ok(StatusCode::Unreproducible),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::Success.exit_code(), 0);
        assert_eq!(StatusCode::Failure.exit_code(), 1);
        assert_eq!(StatusCode::Unreproducible.exit_code(), 42);
        assert_eq!(StatusCode::Unreproducible.as_str(), "42");
        assert_eq!(StatusCode::try_from(42), Ok(StatusCode::Unreproducible));
        assert_eq!(StatusCode::try_from(99), Err(99));
    }

    #[test]
    fn test_classification() {
        assert_eq!(ComparisonResult::Reproducible.status_code(), StatusCode::Success);
        assert_eq!(ComparisonResult::Reproducible.message(), "Success");

        let unrepro = ComparisonResult::Unreproducible(DiffReport::new("/tmp/out"));
        assert_eq!(unrepro.status_code(), StatusCode::Unreproducible);
        assert_eq!(unrepro.message(), "Unreproducible");
        assert_eq!(unrepro.diff_report().unwrap().dir(), Path::new("/tmp/out"));

        let failed = ComparisonResult::failed(
            Stage::Resolve,
            FailureCause::UnsupportedRefKind {
                id: "org.gnome.Platform".to_string(),
                kind: RefKind::Runtime,
            },
        );
        assert_eq!(failed.status_code(), StatusCode::Failure);
        assert_eq!(failed.failed_stage(), Some(Stage::Resolve));
        assert!(failed.message().contains("Unsupported ref kind 'runtime'"));
        assert!(failed.diff_report().is_none());
    }

    #[test]
    fn test_stage_cause_mapping() {
        let timeout = ToolError::Timeout {
            program: "flatpak-builder".to_string(),
            limit: Duration::from_secs(5),
        };
        assert!(matches!(Stage::Build.cause(timeout), FailureCause::Timeout(_)));

        let failed = ToolError::Failed {
            context: "diffoscope".to_string(),
            code: 2,
            detail: String::new(),
        };
        assert!(matches!(
            Stage::Compare.cause(failed),
            FailureCause::CompareToolFailure(_)
        ));
        assert!(matches!(
            Stage::Resolve.cause(ToolError::NotFound("flatpak".to_string())),
            FailureCause::ResolveFailure(_)
        ));
    }
}
