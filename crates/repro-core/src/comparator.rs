//! Artifact comparison: tree digests first, diffoscope on divergence.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use repro_tooling::{CommandRunner, FlatpakRef, ToolCommand};
use tracing::{error, info, warn};

use crate::digest::{tree_digest, TreeDigest};
use crate::domain::{ComparisonResult, DiffReport, FailureCause, Stage};
use crate::fs_util::remove_path;

/// A built application tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub flatpak_ref: FlatpakRef,
    pub files: PathBuf,
    pub digest: Option<TreeDigest>,
}

impl Artifact {
    pub fn new(flatpak_ref: FlatpakRef, files: impl Into<PathBuf>) -> Self {
        Self {
            flatpak_ref,
            files: files.into(),
            digest: None,
        }
    }

    /// Compute and store the tree digest.
    pub async fn compute_digest(&mut self) -> Result<&TreeDigest, FailureCause> {
        let root = self.files.clone();
        let digest = tokio::task::spawn_blocking(move || tree_digest(&root))
            .await
            .map_err(|e| FailureCause::CompareToolFailure(format!("digest task failed: {e}")))?
            .map_err(|e| {
                FailureCause::CompareToolFailure(format!(
                    "Failed to digest {}: {e}",
                    self.files.display()
                ))
            })?;
        Ok(self.digest.insert(digest))
    }
}

/// Compares a reference and a candidate artifact.
pub struct Comparator {
    runner: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl Comparator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Compare the two trees. A report is written to `output_dir` only when
    /// the result is [`ComparisonResult::Unreproducible`].
    pub async fn compare(
        &self,
        reference: &mut Artifact,
        candidate: &mut Artifact,
        output_dir: &Path,
    ) -> ComparisonResult {
        let digests = async {
            let r = reference.compute_digest().await?.clone();
            let c = candidate.compute_digest().await?.clone();
            Ok::<_, FailureCause>((r, c))
        };
        let (ref_digest, cand_digest) = match digests.await {
            Ok(pair) => pair,
            Err(cause) => return ComparisonResult::failed(Stage::Compare, cause),
        };

        info!(
            reference = %ref_digest.short(),
            candidate = %cand_digest.short(),
            "Tree digests computed"
        );

        if ref_digest == cand_digest {
            info!("Result is reproducible");
            clear_output(output_dir);
            return ComparisonResult::Reproducible;
        }

        self.run_diffoscope(&reference.files, &candidate.files, output_dir)
            .await
    }

    async fn run_diffoscope(&self, a: &Path, b: &Path, output_dir: &Path) -> ComparisonResult {
        clear_output(output_dir);

        let cmd = ToolCommand::new("diffoscope")
            .arg(format!("--html-dir={}", output_dir.display()))
            .arg("--exclude-directory-metadata=recursive")
            .arg(a.to_string_lossy())
            .arg(b.to_string_lossy())
            .timeout(self.timeout)
            .context("Diffoscope failed");

        let output = match self.runner.run(&cmd).await {
            Ok(output) => output,
            Err(e) => return ComparisonResult::failed(Stage::Compare, Stage::Compare.cause(e)),
        };

        match output.exit_code {
            0 => {
                info!("Result is reproducible");
                clear_output(output_dir);
                ComparisonResult::Reproducible
            }
            1 if has_report(output_dir) => {
                error!("Result is not reproducible");
                ComparisonResult::Unreproducible(DiffReport::new(output_dir))
            }
            1 => ComparisonResult::failed(
                Stage::Compare,
                FailureCause::CompareToolFailure(
                    "Diffoscope reported differences but produced no report".to_string(),
                ),
            ),
            code => {
                error!("Diffoscope failed with code {code}");
                let cause = Stage::Compare.cause(output.into_failure(&cmd));
                ComparisonResult::failed(Stage::Compare, cause)
            }
        }
    }
}

fn has_report(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn clear_output(dir: &Path) {
    if let Err(e) = remove_path(dir) {
        warn!("Failed to remove {}: {e}", dir.display());
    }
}
