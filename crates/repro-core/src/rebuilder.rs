//! Rebuilder: reproduces the build environment and runs flatpak-builder.
//!
//! Build dependencies are installed and pinned to the exact commits the
//! published build recorded. Pinned refs are masked for the rest of the run
//! so nothing updates them; [`MaskGuard`] removes the masks again on every
//! exit path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use repro_tooling::{
    checkout_bare_mirror, file_protocol_env, find_app_branch, fp_builder_filename_to_uri,
    parse_gl_version, Flatpak, Git, InstallSource, Manifest, Ostree, ToolCommand, ToolError,
    FLATHUB_REMOTE,
};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::{CheckerConfig, BUILD_BRANCH, REF_ARCH, SCREENSHOTS_URL, SOURCE_DATE_EPOCH};
use crate::domain::{FailureCause, Stage};
use crate::fs_util::{copy_dir_all, copy_path, remove_path};
use crate::resolver::BuildMetadata;

/// Output of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Branch the rebuilt app was installed on.
    pub branch: String,
    pub log_path: PathBuf,
}

/// Holds masks on pinned refs and removes them when released or dropped.
pub struct MaskGuard {
    flatpak: Flatpak,
    patterns: Vec<String>,
}

impl MaskGuard {
    pub fn new(flatpak: Flatpak) -> Self {
        Self {
            flatpak,
            patterns: Vec::new(),
        }
    }

    pub async fn mask(&mut self, pattern: &str) -> repro_tooling::Result<()> {
        self.flatpak.mask(pattern, false).await?;
        self.patterns.push(pattern.to_string());
        Ok(())
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Unmask everything. Failures are logged and otherwise ignored.
    pub async fn release(mut self) {
        for pattern in std::mem::take(&mut self.patterns) {
            if let Err(e) = self.flatpak.mask(&pattern, true).await {
                warn!("{e}");
            }
        }
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        for pattern in self.patterns.drain(..) {
            self.flatpak.unmask_blocking(&pattern);
        }
    }
}

/// Rebuilds an app from its recorded build metadata.
pub struct Rebuilder<'a> {
    flatpak: &'a Flatpak,
    ostree: &'a Ostree,
    git: &'a Git,
    config: &'a CheckerConfig,
}

impl<'a> Rebuilder<'a> {
    pub fn new(
        flatpak: &'a Flatpak,
        ostree: &'a Ostree,
        git: &'a Git,
        config: &'a CheckerConfig,
    ) -> Self {
        Self {
            flatpak,
            ostree,
            git,
            config,
        }
    }

    /// Run every rebuild step. Masks taken along the way are recorded in
    /// `masks` even when a later step fails.
    pub async fn rebuild(
        &self,
        meta: &BuildMetadata,
        masks: &mut MaskGuard,
    ) -> Result<BuildOutput, FailureCause> {
        let log_path = self.config.build_log_path(meta.app_id.as_str());
        reset_build_log(&log_path)?;

        let state_dir = match self.prepare_build(meta, masks).await {
            Ok(dir) => dir,
            Err(cause) => {
                record_failure(&log_path, &cause);
                return Err(cause);
            }
        };
        self.run_builder(meta, &state_dir).await
    }

    async fn prepare_build(
        &self,
        meta: &BuildMetadata,
        masks: &mut MaskGuard,
    ) -> Result<PathBuf, FailureCause> {
        self.install_dependencies(&meta.manifest).await?;
        self.pin_dependencies(&meta.manifest, masks).await?;
        let state_dir = self.prepare_state_dir(meta.app_id.as_str())?;
        self.populate_sources(meta, &state_dir).await?;
        Ok(state_dir)
    }

    /// Runtime, SDK, base app and extension refs the build needs, without
    /// duplicates.
    pub async fn dependency_refs(&self, manifest: &Manifest) -> Result<Vec<String>, FailureCause> {
        let runtime = manifest.runtime_ref().map_err(build_failure)?;
        let sdk = manifest.sdk_ref().map_err(build_failure)?;
        let mut refs = vec![runtime.clone(), sdk];

        if !manifest.sdk_extensions().is_empty() {
            let metadata = self
                .flatpak
                .remote_metadata(FLATHUB_REMOTE, &runtime)
                .await
                .map_err(|e| Stage::Build.cause(e))?;
            match parse_gl_version(&metadata) {
                Some(version) => refs.extend(manifest.sdk_extension_refs(&version)),
                None => error!(
                    "Failed to determine the version of the base runtime for '{runtime}'. \
                     This may result in missing build dependencies during the build process"
                ),
            }
        }

        refs.extend(manifest.add_build_extension_refs());
        refs.extend(manifest.baseapp_ref());

        let mut seen = std::collections::HashSet::new();
        refs.retain(|r| seen.insert(r.clone()));
        Ok(refs)
    }

    pub async fn install_dependencies(&self, manifest: &Manifest) -> Result<(), FailureCause> {
        let source = InstallSource::flathub();
        for dep in self.dependency_refs(manifest).await? {
            self.flatpak
                .install(&dep, &source)
                .await
                .map_err(|e| Stage::Build.cause(e))?;
        }
        Ok(())
    }

    /// Move runtime, SDK and base app to their recorded commits and mask
    /// them.
    pub async fn pin_dependencies(
        &self,
        manifest: &Manifest,
        masks: &mut MaskGuard,
    ) -> Result<(), FailureCause> {
        let pinned = manifest.pinned_refs().map_err(|e| {
            FailureCause::BuildFailure(format!("No pinned refs found in manifest: {e}"))
        })?;

        for (flatpak_ref, commit) in &pinned {
            self.flatpak
                .update_to_commit(flatpak_ref, commit)
                .await
                .map_err(|e| Stage::Build.cause(e))?;
        }
        for (flatpak_ref, _) in &pinned {
            masks
                .mask(flatpak_ref)
                .await
                .map_err(|e| Stage::Build.cause(e))?;
        }
        Ok(())
    }

    /// Fresh builder state directory for `app_id`.
    pub fn prepare_state_dir(&self, app_id: &str) -> Result<PathBuf, FailureCause> {
        let dir = self.config.builder_state_dir(app_id);
        remove_path(&dir)
            .and_then(|()| std::fs::create_dir_all(dir.join("downloads")))
            .and_then(|()| std::fs::create_dir_all(dir.join("git")))
            .map_err(|e| {
                FailureCause::BuildFailure(format!(
                    "Failed to prepare builder state directory {}: {e}",
                    dir.display()
                ))
            })?;
        Ok(dir)
    }

    /// Seed the manifest directory and builder state from the sources
    /// extension so the build runs offline against the published inputs.
    pub async fn populate_sources(
        &self,
        meta: &BuildMetadata,
        state_dir: &Path,
    ) -> Result<(), FailureCause> {
        let sources = self.flatpak.files_dir(&meta.sources_ref);
        let manifest_dir = meta.manifest_dir();
        let io_fail = |e: std::io::Error| {
            FailureCause::BuildFailure(format!("Failed to prepare build sources: {e}"))
        };

        self.checkout_git_mirrors(meta, &sources.join("git"), &state_dir.join("git"))
            .await?;

        let sources_manifest = sources.join("manifest");
        if sources_manifest.is_dir() {
            let id = meta.app_id.as_str();
            let skip = [format!("{id}.json"), format!("{id}.yml"), format!("{id}.yaml")];
            for entry in std::fs::read_dir(&sources_manifest).map_err(io_fail)? {
                let entry = entry.map_err(io_fail)?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let src = entry.path();
                if src.is_file() && skip.iter().any(|s| name.ends_with(s.as_str())) {
                    continue;
                }
                let dest = manifest_dir.join(&name);
                if src.is_dir() {
                    remove_path(&dest).map_err(io_fail)?;
                }
                copy_path(&src, &dest).map_err(io_fail)?;
            }
        }

        let downloads = sources.join("downloads");
        if downloads.is_dir() {
            copy_dir_all(&downloads, &state_dir.join("downloads")).map_err(io_fail)?;
        }

        for name in meta.manifest.collect_src_paths() {
            let target = manifest_dir.join(&name);
            if target.exists() {
                continue;
            }
            let found = WalkDir::new(manifest_dir)
                .into_iter()
                .filter_map(Result::ok)
                .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == name);
            if let Some(entry) = found {
                debug!("Copying {} to {}", entry.path().display(), target.display());
                std::fs::copy(entry.path(), &target).map_err(io_fail)?;
            }
        }

        Ok(())
    }

    async fn checkout_git_mirrors(
        &self,
        meta: &BuildMetadata,
        mirrors: &Path,
        state_git: &Path,
    ) -> Result<(), FailureCause> {
        if !mirrors.is_dir() {
            return Ok(());
        }
        let io_fail = |e: std::io::Error| {
            FailureCause::BuildFailure(format!("Failed to prepare git mirrors: {e}"))
        };

        let mut replacements: HashMap<String, PathBuf> = HashMap::new();
        for entry in std::fs::read_dir(mirrors).map_err(io_fail)? {
            let entry = entry.map_err(io_fail)?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let uri = fp_builder_filename_to_uri(&name);
            let Some(commit) = meta.manifest.git_commit_for(&uri) else {
                continue;
            };

            let dest = state_git.join(&name);
            copy_dir_all(&entry.path(), &dest).map_err(io_fail)?;
            match checkout_bare_mirror(self.git, &dest, meta.manifest_dir(), &commit).await {
                Ok(checkout) => {
                    replacements.insert(uri, checkout);
                }
                Err(e) => warn!("Skipping git mirror {name}: {e}"),
            }
        }

        if !replacements.is_empty() {
            let count = Manifest::rewrite_git_sources(&meta.manifest_path, &replacements)
                .map_err(build_failure)?;
            info!("Rewrote {count} git sources to local checkouts");
        }
        Ok(())
    }

    /// Run flatpak-builder in the manifest directory and find the branch
    /// the result was installed on.
    pub async fn run_builder(
        &self,
        meta: &BuildMetadata,
        state_dir: &Path,
    ) -> Result<BuildOutput, FailureCause> {
        let manifest_dir = meta.manifest_dir();
        let manifest_file = meta
            .manifest_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let log_path = self.config.build_log_path(meta.app_id.as_str());
        reset_build_log(&log_path)?;

        let mut cmd = ToolCommand::new("flatpak-builder")
            .args([
                "--force-clean",
                "--sandbox",
                "--delete-build-dirs",
                "--override-source-date-epoch",
                SOURCE_DATE_EPOCH,
                "--user",
            ])
            .arg(format!("--mirror-screenshots-url={SCREENSHOTS_URL}"))
            .args(["--repo=repo", "--install"])
            .arg(format!("--default-branch={BUILD_BRANCH}"))
            .arg("--disable-rofiles-fuse")
            .arg(format!("--state-dir={}", state_dir.display()))
            .arg("--assumeyes")
            .arg(format!("--arch={REF_ARCH}"))
            .arg("builddir")
            .arg(manifest_file.as_str())
            .current_dir(manifest_dir)
            .log_to(&log_path)
            .timeout(self.flatpak.timeout())
            .context(format!("Failed to run flatpak-builder on '{manifest_file}'"));
        for (key, value) in self.flatpak.environment().into_iter().chain(file_protocol_env()) {
            cmd = cmd.env(key, value);
        }

        self.flatpak
            .runner()
            .run_checked(&cmd)
            .await
            .map_err(|e| Stage::Build.cause(e))?;
        info!("Build log written to {}", log_path.display());

        let refs = self
            .ostree
            .refs(&manifest_dir.join("repo"))
            .await
            .map_err(|e| Stage::Build.cause(e))?;
        let branch = find_app_branch(&refs).ok_or_else(|| {
            FailureCause::BuildFailure("Failed to find the branch of the built app".to_string())
        })?;

        Ok(BuildOutput { branch, log_path })
    }
}

fn build_failure(err: ToolError) -> FailureCause {
    Stage::Build.cause(err)
}

/// Drop the log of any earlier run so this run never reports it.
fn reset_build_log(path: &Path) -> Result<(), FailureCause> {
    remove_path(path)
        .map_err(|e| FailureCause::BuildFailure(format!("Failed to reset build log: {e}")))
}

/// Write the cause of a failure that happened before flatpak-builder ran.
fn record_failure(path: &Path, cause: &FailureCause) {
    let written = match path.parent() {
        Some(parent) => std::fs::create_dir_all(parent),
        None => Ok(()),
    }
    .and_then(|()| std::fs::write(path, format!("{cause}\n")));
    if let Err(e) = written {
        warn!("Failed to write build log {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repro_tooling::fakes::ScriptedRunner;
    use repro_tooling::CommandOutput;
    use std::sync::Arc;

    fn tools(runner: &Arc<ScriptedRunner>) -> (Flatpak, Ostree, Git) {
        let flatpak = Flatpak::new(runner.clone(), "/data/flatpak_root").in_container(false);
        (flatpak, Ostree::new(runner.clone()), Git::new(runner.clone()))
    }

    #[tokio::test]
    async fn test_dependency_refs_with_gl_extensions() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "flatpak",
            &["remote-info", "-m"],
            CommandOutput::ok(
                "[Extension org.freedesktop.Platform.GL]\nversions=24.08;1.4\nversion=1.4\n",
            ),
        );
        let (flatpak, ostree, git) = tools(&runner);
        let config = CheckerConfig::with_data_dir("/data");
        let manifest = Manifest::parse(
            r#"{
                "id": "org.example.App",
                "runtime": "org.gnome.Platform",
                "runtime-version": "48",
                "sdk": "org.gnome.Sdk",
                "sdk-extensions": ["org.freedesktop.Sdk.Extension.rust-stable"],
                "base": "org.electronjs.Electron2.BaseApp",
                "base-version": "24.08"
            }"#,
        )
        .unwrap();

        let refs = Rebuilder::new(&flatpak, &ostree, &git, &config)
            .dependency_refs(&manifest)
            .await
            .unwrap();
        assert_eq!(refs[0], "org.gnome.Platform//48");
        assert_eq!(refs[1], "org.gnome.Sdk//48");
        assert!(refs.contains(&"org.electronjs.Electron2.BaseApp//24.08".to_string()));
        assert!(refs
            .iter()
            .any(|r| r.starts_with("org.freedesktop.Sdk.Extension.rust-stable//")));
    }

    #[tokio::test]
    async fn test_unknown_runtime_is_build_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        let (flatpak, ostree, git) = tools(&runner);
        let config = CheckerConfig::with_data_dir("/data");
        let manifest = Manifest::parse(
            r#"{"id": "org.example.App", "runtime": "com.example.Platform",
                "runtime-version": "1", "sdk": "com.example.Sdk"}"#,
        )
        .unwrap();

        let err = Rebuilder::new(&flatpak, &ostree, &git, &config)
            .install_dependencies(&manifest)
            .await
            .unwrap_err();
        assert!(matches!(err, FailureCause::BuildFailure(_)));
        assert!(!runner.was_called_with("flatpak", &["install"]));
    }

    #[tokio::test]
    async fn test_mask_guard_release_unmasks_everything() {
        let runner = Arc::new(ScriptedRunner::new());
        let (flatpak, _, _) = tools(&runner);

        let mut masks = MaskGuard::new(flatpak);
        masks.mask("org.gnome.Platform//48").await.unwrap();
        masks.mask("org.gnome.Sdk//48").await.unwrap();
        assert_eq!(masks.patterns().len(), 2);
        masks.release().await;

        assert!(runner.was_called_with("flatpak", &["mask", "--remove", "org.gnome.Platform//48"]));
        assert!(runner.was_called_with("flatpak", &["mask", "--remove", "org.gnome.Sdk//48"]));
    }

    #[test]
    fn test_record_failure_replaces_previous_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/org.example.App/build.log");
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        std::fs::write(&log, "Build succeeded\n").unwrap();

        reset_build_log(&log).unwrap();
        assert!(!log.exists());
        record_failure(&log, &FailureCause::BuildFailure("network down".to_string()));
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "network down\n");
    }

    #[test]
    fn test_prepare_state_dir_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let (flatpak, ostree, git) = tools(&runner);
        let config = CheckerConfig::with_data_dir(dir.path());
        let rebuilder = Rebuilder::new(&flatpak, &ostree, &git, &config);

        let state = rebuilder.prepare_state_dir("org.example.App").unwrap();
        std::fs::write(state.join("stale"), "x").unwrap();
        let state = rebuilder.prepare_state_dir("org.example.App").unwrap();
        assert!(!state.join("stale").exists());
        assert!(state.join("downloads").is_dir());
        assert!(state.join("git").is_dir());
    }
}
