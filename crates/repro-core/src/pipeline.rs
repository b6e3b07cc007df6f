//! The verification pipeline: resolve, rebuild, compare, publish, report.
//!
//! Stages run strictly in order and the first failure ends the run. Stage
//! errors become [`ComparisonResult::Failed`]; only environment problems
//! (missing tools, a held lock, an unwritable root) escape as [`ReproError`],
//! because no record can be produced for them.
//!
//! [`ReproError`]: crate::domain::ReproError

use std::path::{Path, PathBuf};
use std::sync::Arc;

use repro_tooling::{CommandRunner, Flatpak, Git, Ostree, REQUIRED_TOOLS};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::comparator::{Artifact, Comparator};
use crate::config::{CheckerConfig, CiContext};
use crate::domain::{
    CheckTarget, ComparisonResult, FailureCause, Result, ResultRecord, Stage,
};
use crate::fs_util::remove_path;
use crate::guard::{check_tools, WorkingRoot};
use crate::publisher::{apply_upload_policy, ObjectStore, Publisher};
use crate::quarantine::Quarantine;
use crate::rebuilder::{BuildOutput, MaskGuard, Rebuilder};
use crate::reporter::{build_record, resolve_log_url};
use crate::resolver::{precheck, BuildMetadata, ReferenceResolver};

/// What to check and what to do with the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub target: CheckTarget,
    /// Local OSTree repo holding the reference build instead of Flathub.
    pub ref_build_path: Option<PathBuf>,
    /// Where the diff report goes.
    pub output_dir: PathBuf,
    pub upload: bool,
    pub strict_upload: bool,
}

impl CheckRequest {
    /// Request with the default output directory `./diffoscope_result-<id>`.
    pub fn new(target: CheckTarget) -> Self {
        let output_dir = absolute(&target.id.default_output_dir());
        Self {
            target,
            ref_build_path: None,
            output_dir,
            upload: false,
            strict_upload: false,
        }
    }

    pub fn with_ref_build_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ref_build_path = Some(path.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = absolute(dir.as_ref());
        self
    }

    pub fn with_upload(mut self, upload: bool, strict: bool) -> Self {
        self.upload = upload;
        self.strict_upload = strict;
        self
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub run_id: Uuid,
    pub result: ComparisonResult,
    pub record: ResultRecord,
    pub build_log: Option<PathBuf>,
}

/// Runs checks against a private Flatpak installation.
pub struct Checker {
    runner: Arc<dyn CommandRunner>,
    config: CheckerConfig,
    ci: CiContext,
    store: Option<Arc<dyn ObjectStore>>,
    required_tools: Vec<String>,
    in_container: Option<bool>,
}

impl Checker {
    pub fn new(runner: Arc<dyn CommandRunner>, config: CheckerConfig) -> Self {
        Self {
            runner,
            config,
            ci: CiContext::from_env(),
            store: None,
            required_tools: REQUIRED_TOOLS.iter().map(|t| t.to_string()).collect(),
            in_container: None,
        }
    }

    /// Object store used when a request asks for uploads.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_ci(mut self, ci: CiContext) -> Self {
        self.ci = ci;
        self
    }

    /// Tools that must be on `PATH` before a run starts.
    pub fn with_required_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// Override container detection for the Flatpak client.
    pub fn in_container(mut self, in_container: bool) -> Self {
        self.in_container = Some(in_container);
        self
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Run one check to completion.
    pub async fn check(&self, request: &CheckRequest) -> Result<CheckReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("check", %run_id, appid = %request.target.id);
        self.check_inner(request, run_id).instrument(span).await
    }

    async fn check_inner(&self, request: &CheckRequest, run_id: Uuid) -> Result<CheckReport> {
        let source = match precheck(&request.target, request.ref_build_path.as_deref()) {
            Ok(source) => source,
            Err(cause) => {
                let result = ComparisonResult::failed(Stage::Resolve, cause);
                return Ok(self.report(request, run_id, result, None, None, None));
            }
        };

        let tools: Vec<&str> = self.required_tools.iter().map(String::as_str).collect();
        check_tools(&tools)?;
        let root = WorkingRoot::acquire(&self.config)?;

        let mut flatpak = Flatpak::new(Arc::clone(&self.runner), root.flatpak_root())
            .with_timeout(self.config.timeout);
        if let Some(in_container) = self.in_container {
            flatpak = flatpak.in_container(in_container);
        }
        let ostree = Ostree::new(Arc::clone(&self.runner)).with_timeout(self.config.timeout);
        let git = Git::new(Arc::clone(&self.runner)).with_timeout(self.config.timeout);

        info!("Checking {}", request.target.id);
        let resolver = ReferenceResolver::new(&flatpak, &ostree, &self.config);
        let meta = match resolver.resolve(&request.target, &source).await {
            Ok(meta) => meta,
            Err(cause) => {
                let result = ComparisonResult::failed(Stage::Resolve, cause);
                return Ok(self.finish(request, run_id, result, None).await);
            }
        };

        let mut masks = MaskGuard::new(flatpak.clone());
        let rebuilder = Rebuilder::new(&flatpak, &ostree, &git, &self.config);
        let result = match rebuilder.rebuild(&meta, &mut masks).await {
            Ok(output) => self.compare(&flatpak, &meta, &output, &request.output_dir).await,
            Err(cause) => ComparisonResult::failed(Stage::Build, cause),
        };
        masks.release().await;

        let build_log = self.config.build_log_path(meta.app_id.as_str());
        let report = self.finish(request, run_id, result, Some(build_log)).await;
        drop(root);
        Ok(report)
    }

    async fn compare(
        &self,
        flatpak: &Flatpak,
        meta: &BuildMetadata,
        output: &BuildOutput,
        output_dir: &Path,
    ) -> ComparisonResult {
        let candidate_ref = meta.app_ref.with_branch(output.branch.as_str());
        let mut reference = Artifact::new(meta.app_ref.clone(), flatpak.files_dir(&meta.app_ref));
        let mut candidate = Artifact::new(candidate_ref.clone(), flatpak.files_dir(&candidate_ref));
        info!(reference = %reference.flatpak_ref, candidate = %candidate.flatpak_ref, "Comparing");

        let quarantine = match Quarantine::isolate(
            &self.config.backups_dir(),
            &reference.files,
            &candidate.files,
        ) {
            Ok(q) => q,
            Err(cause) => return ComparisonResult::failed(Stage::Compare, cause),
        };

        let result = Comparator::new(Arc::clone(&self.runner))
            .with_timeout(self.config.timeout)
            .compare(&mut reference, &mut candidate, output_dir)
            .await;
        quarantine.restore();
        result
    }

    /// Publish if requested, then build the record.
    async fn finish(
        &self,
        request: &CheckRequest,
        run_id: Uuid,
        result: ComparisonResult,
        build_log: Option<PathBuf>,
    ) -> CheckReport {
        if !request.upload {
            return self.report(request, run_id, result, build_log, None, None);
        }

        let Some(store) = &self.store else {
            warn!("Result upload requested but no object store is configured");
            let result = if request.strict_upload && result.failed_stage().is_none() {
                ComparisonResult::failed(
                    Stage::Upload,
                    FailureCause::UploadFailure("No object store configured".to_string()),
                )
            } else {
                result
            };
            return self.report(request, run_id, result, build_log, None, None);
        };

        let log_key_id = self
            .ci
            .github_run_id
            .clone()
            .unwrap_or_else(|| run_id.simple().to_string());
        let scratch = std::env::temp_dir().join(format!("flathub-repro-{}", run_id.simple()));
        if let Err(e) = std::fs::create_dir_all(&scratch) {
            warn!("Failed to create {}: {e}", scratch.display());
        }
        let outcome = Publisher::new(store.as_ref(), &scratch)
            .publish(
                request.target.id.as_str(),
                &log_key_id,
                &result,
                build_log.as_deref(),
            )
            .await;
        if let Err(e) = remove_path(&scratch) {
            warn!("Failed to remove {}: {e}", scratch.display());
        }
        let result = apply_upload_policy(result, &outcome, request.strict_upload);
        self.report(
            request,
            run_id,
            result,
            build_log,
            outcome.result_url,
            outcome.log_url,
        )
    }

    fn report(
        &self,
        request: &CheckRequest,
        run_id: Uuid,
        result: ComparisonResult,
        build_log: Option<PathBuf>,
        result_url: Option<String>,
        uploaded_log: Option<String>,
    ) -> CheckReport {
        let log_url = resolve_log_url(&self.ci, uploaded_log.as_deref(), build_log.as_deref());
        let record = build_record(request.target.id.as_str(), &result, log_url, result_url);
        CheckReport {
            run_id,
            result,
            record,
            build_log,
        }
    }
}
