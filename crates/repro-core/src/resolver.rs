//! Reference resolver: installs the published build and records its metadata.
//!
//! Every failure here is a `Failed(resolve, …)` outcome; nothing this stage
//! does can make a run `Unreproducible`.

use std::path::{Path, PathBuf};

use repro_tooling::{
    sources_ref_for, Flatpak, FlatpakRef, InstallSource, Manifest, Ostree, RefKind, ToolError,
    FLATHUB_REMOTE, FLATHUB_REPO_URL,
};
use tracing::{error, info, warn};

use crate::config::{is_unsupported_app, CheckerConfig, REF_ARCH, REF_BRANCH};
use crate::domain::{ApplicationId, CheckTarget, FailureCause, Stage};

/// Everything the rebuilder needs to know about the published build.
#[derive(Debug, Clone)]
pub struct BuildMetadata {
    pub app_id: ApplicationId,
    pub app_ref: FlatpakRef,
    /// Installed commit of the reference build.
    pub commit: String,
    pub manifest_path: PathBuf,
    pub manifest: Manifest,
    pub sources_ref: FlatpakRef,
    pub source: InstallSource,
}

impl BuildMetadata {
    pub fn manifest_dir(&self) -> &Path {
        self.manifest_path.parent().unwrap_or(Path::new("."))
    }
}

/// Reject targets that cannot be checked before any tool runs, and pick
/// where the reference build comes from.
pub fn precheck(
    target: &CheckTarget,
    ref_build_path: Option<&Path>,
) -> Result<InstallSource, FailureCause> {
    let id = target.id.as_str();
    if is_unsupported_app(id) {
        let msg = format!("Running the checker against '{id}' is unsupported right now");
        error!("{msg}");
        return Err(FailureCause::ResolveFailure(msg));
    }

    match ref_build_path {
        None => Ok(InstallSource::flathub()),
        Some(path) => {
            let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
            if abs.is_dir() {
                Ok(InstallSource::LocalRepo(abs))
            } else {
                let msg = format!("The path does not exist: {}", abs.display());
                error!("{msg}");
                Err(FailureCause::ResolveFailure(msg))
            }
        }
    }
}

/// Installs the reference build into the working root.
pub struct ReferenceResolver<'a> {
    flatpak: &'a Flatpak,
    ostree: &'a Ostree,
    config: &'a CheckerConfig,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(flatpak: &'a Flatpak, ostree: &'a Ostree, config: &'a CheckerConfig) -> Self {
        Self {
            flatpak,
            ostree,
            config,
        }
    }

    pub async fn resolve(
        &self,
        target: &CheckTarget,
        source: &InstallSource,
    ) -> Result<BuildMetadata, FailureCause> {
        let id = &target.id;
        let fail = |e: ToolError| Stage::Resolve.cause(e);

        self.flatpak
            .add_remote(FLATHUB_REMOTE, FLATHUB_REPO_URL)
            .await
            .map_err(fail)?;

        let kind = match target.kind {
            Some(kind) => kind,
            None => self.probe_kind(id, source).await?,
        };
        if kind != RefKind::App {
            let cause = FailureCause::UnsupportedRefKind {
                id: id.to_string(),
                kind,
            };
            error!("{cause}");
            return Err(cause);
        }

        let app_ref = id.app_ref(REF_ARCH, REF_BRANCH);
        self.flatpak
            .install(&app_ref.to_string(), source)
            .await
            .map_err(fail)?;

        let sources_ref = sources_ref_for(id.as_str(), REF_ARCH, REF_BRANCH);
        if !self.has_ref(source, &sources_ref).await.map_err(fail)? {
            let msg = format!("Failed to find sources extension for '{id}'");
            warn!("{msg}");
            return Err(FailureCause::ResolveFailure(msg));
        }
        self.flatpak
            .install(&sources_ref.to_string(), source)
            .await
            .map_err(fail)?;

        let (manifest_path, manifest) = self.save_manifest(id, &app_ref).await?;
        let commit = self.flatpak.installed_commit(&app_ref).await.map_err(fail)?;
        info!(%app_ref, %commit, "Reference build installed");

        Ok(BuildMetadata {
            app_id: id.clone(),
            app_ref,
            commit,
            manifest_path,
            manifest,
            sources_ref,
            source: source.clone(),
        })
    }

    /// Classify a bare id by probing for an app ref, then a runtime ref.
    async fn probe_kind(
        &self,
        id: &ApplicationId,
        source: &InstallSource,
    ) -> Result<RefKind, FailureCause> {
        let fail = |e: ToolError| Stage::Resolve.cause(e);

        let app_ref = id.app_ref(REF_ARCH, REF_BRANCH);
        if self.has_ref(source, &app_ref).await.map_err(fail)? {
            return Ok(RefKind::App);
        }

        let runtime_ref = FlatpakRef::runtime(id.as_str(), REF_ARCH, REF_BRANCH);
        if self.has_ref(source, &runtime_ref).await.map_err(fail)? {
            return Ok(runtime_ref.kind);
        }

        let msg = format!("'{id}' was not found in '{source}'");
        error!("{msg}");
        Err(FailureCause::ResolveFailure(msg))
    }

    async fn has_ref(
        &self,
        source: &InstallSource,
        flatpak_ref: &FlatpakRef,
    ) -> repro_tooling::Result<bool> {
        match source {
            InstallSource::Remote(remote) => self.flatpak.remote_has_ref(remote, flatpak_ref).await,
            InstallSource::LocalRepo(repo) => {
                let wanted = flatpak_ref.to_string();
                Ok(self.ostree.refs(repo).await?.iter().any(|r| *r == wanted))
            }
        }
    }

    /// Extract `/app/manifest.json` from the installed app into the data
    /// directory, replacing any previous copy.
    async fn save_manifest(
        &self,
        id: &ApplicationId,
        app_ref: &FlatpakRef,
    ) -> Result<(PathBuf, Manifest), FailureCause> {
        let io_fail =
            |e: std::io::Error| FailureCause::ResolveFailure(format!("Failed to save manifest: {e}"));

        let dir = self.config.manifest_dir(id.as_str());
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(io_fail)?;
        }
        std::fs::create_dir_all(&dir).map_err(io_fail)?;

        let contents = self
            .flatpak
            .cat_file(app_ref, "/app/manifest.json")
            .await
            .map_err(|e| Stage::Resolve.cause(e))?;

        let path = self.config.manifest_path(id.as_str());
        std::fs::write(&path, contents).map_err(io_fail)?;

        let manifest = Manifest::load_for(&path, id.as_str()).map_err(|e| {
            error!("{e}");
            Stage::Resolve.cause(e)
        })?;
        Ok((path, manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precheck_rejects_unsupported_ids() {
        let target: CheckTarget = "org.mozilla.firefox".parse().unwrap();
        let err = precheck(&target, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Running the checker against 'org.mozilla.firefox' is unsupported right now"
        );
    }

    #[test]
    fn test_precheck_rejects_missing_repo_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("repo");
        let target: CheckTarget = "org.example.App".parse().unwrap();
        let err = precheck(&target, Some(&missing)).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("The path does not exist: {}", missing.display())
        );
    }

    #[test]
    fn test_precheck_picks_source() {
        let dir = tempfile::tempdir().unwrap();
        let target: CheckTarget = "org.example.App".parse().unwrap();
        assert_eq!(precheck(&target, None).unwrap(), InstallSource::flathub());
        assert_eq!(
            precheck(&target, Some(dir.path())).unwrap(),
            InstallSource::LocalRepo(dir.path().to_path_buf())
        );
    }
}
