//! Flatpak and OSTree command wrappers.
//!
//! All `flatpak` invocations run against a private user installation
//! (`FLATPAK_USER_DIR`) so the checker never touches the invoking user's
//! own Flatpak state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, ToolCommand};
use crate::error::ToolError;
use crate::Result;

/// Name of the public remote the reference builds come from.
pub const FLATHUB_REMOTE: &str = "flathub";

/// `.flatpakrepo` descriptor for [`FLATHUB_REMOTE`].
pub const FLATHUB_REPO_URL: &str = "https://dl.flathub.org/repo/flathub.flatpakrepo";

/// Suffixes that mark a runtime-kind id as an extension.
const EXTENSION_SUFFIXES: &[&str] = &[".Debug", ".Locale", ".Sources"];

/// Category of a published ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefKind {
    /// Installable end-user application.
    App,
    /// Shared runtime or SDK.
    Runtime,
    /// Runtime-kind extension (sdk extensions, GL drivers, sources, locales).
    Extension,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::App => "app",
            RefKind::Runtime => "runtime",
            RefKind::Extension => "extension",
        }
    }

    /// First path segment of the ref. Extensions are runtimes on disk.
    pub fn ref_segment(&self) -> &'static str {
        match self {
            RefKind::App => "app",
            RefKind::Runtime | RefKind::Extension => "runtime",
        }
    }

    /// Classify a runtime-kind id as either a plain runtime or an extension.
    pub fn classify_runtime(id: &str) -> RefKind {
        let last = id.rsplit('.').next().unwrap_or(id);
        if id.contains(".Extension.")
            || last.starts_with("GL")
            || EXTENSION_SUFFIXES.iter().any(|s| id.ends_with(s))
        {
            RefKind::Extension
        } else {
            RefKind::Runtime
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully qualified ref: `kind/id/arch/branch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlatpakRef {
    pub kind: RefKind,
    pub id: String,
    pub arch: String,
    pub branch: String,
}

impl FlatpakRef {
    pub fn app(id: impl Into<String>, arch: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            kind: RefKind::App,
            id: id.into(),
            arch: arch.into(),
            branch: branch.into(),
        }
    }

    /// Runtime-kind ref; the kind is refined to [`RefKind::Extension`] when
    /// the id looks like one.
    pub fn runtime(id: impl Into<String>, arch: impl Into<String>, branch: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            kind: RefKind::classify_runtime(&id),
            id,
            arch: arch.into(),
            branch: branch.into(),
        }
    }

    /// Same ref on another branch.
    pub fn with_branch(&self, branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for FlatpakRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.kind.ref_segment(),
            self.id,
            self.arch,
            self.branch
        )
    }
}

impl FromStr for FlatpakRef {
    type Err = ToolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let [kind, id, arch, branch] = parts.as_slice() else {
            return Err(ToolError::InvalidRef(s.to_string()));
        };
        if id.is_empty() {
            return Err(ToolError::InvalidRef(s.to_string()));
        }
        match *kind {
            "app" => Ok(FlatpakRef::app(*id, *arch, *branch)),
            "runtime" => Ok(FlatpakRef::runtime(*id, *arch, *branch)),
            _ => Err(ToolError::InvalidRef(s.to_string())),
        }
    }
}

/// Where `flatpak install` pulls from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// A configured remote, by name.
    Remote(String),
    /// A local OSTree repository.
    LocalRepo(PathBuf),
}

impl InstallSource {
    pub fn flathub() -> Self {
        InstallSource::Remote(FLATHUB_REMOTE.to_string())
    }

    fn as_arg(&self) -> String {
        match self {
            InstallSource::Remote(name) => name.clone(),
            InstallSource::LocalRepo(path) => std::path::absolute(path)
                .unwrap_or_else(|_| path.clone())
                .to_string_lossy()
                .into_owned(),
        }
    }
}

impl fmt::Display for InstallSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_arg())
    }
}

/// Client for the `flatpak` CLI bound to one private installation.
#[derive(Clone)]
pub struct Flatpak {
    runner: Arc<dyn CommandRunner>,
    user_dir: PathBuf,
    in_container: bool,
    timeout: Option<Duration>,
}

impl fmt::Debug for Flatpak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flatpak")
            .field("user_dir", &self.user_dir)
            .field("in_container", &self.in_container)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Flatpak {
    /// Create a client for the installation rooted at `user_dir`.
    pub fn new(runner: Arc<dyn CommandRunner>, user_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            user_dir: user_dir.into(),
            in_container: crate::is_inside_container(),
            timeout: None,
        }
    }

    /// Deadline applied to every invocation.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override container detection.
    pub fn in_container(mut self, in_container: bool) -> Self {
        self.in_container = in_container;
        self
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Environment every flatpak-family tool needs to target the private
    /// installation.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = vec![(
            "FLATPAK_USER_DIR".to_string(),
            self.user_dir.to_string_lossy().into_owned(),
        )];
        if self.in_container {
            env.push(("FLATPAK_SYSTEM_HELPER_ON_SESSION".to_string(), "foo".to_string()));
        }
        env
    }

    fn command<I, S>(&self, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = ToolCommand::new("flatpak").args(args).timeout(self.timeout);
        for (key, value) in self.environment() {
            cmd = cmd.env(key, value);
        }
        cmd
    }

    /// Add a remote unless it already exists.
    pub async fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        let cmd = self
            .command(["remote-add", "--user", "--if-not-exists", name, url])
            .context(format!("Failed to add remote '{name}'"));
        self.runner.run_checked(&cmd).await?;
        Ok(())
    }

    /// Whether `remote` publishes `flatpak_ref`. A non-zero exit means "no";
    /// spawn failures and timeouts are errors.
    pub async fn remote_has_ref(&self, remote: &str, flatpak_ref: &FlatpakRef) -> Result<bool> {
        let cmd = self.command(["remote-info".to_string(), remote.to_string(), flatpak_ref.to_string()]);
        let out = self.runner.run(&cmd).await?;
        debug!(%flatpak_ref, found = out.success(), "remote-info");
        Ok(out.success())
    }

    /// Raw metadata keyfile of a remote ref (`remote-info -m`).
    pub async fn remote_metadata(&self, remote: &str, partial_ref: &str) -> Result<String> {
        let cmd = self
            .command(["remote-info", "-m", remote, partial_ref])
            .context(format!("Failed to run remote-info on '{partial_ref}'"));
        Ok(self.runner.run_checked(&cmd).await?.stdout)
    }

    /// Install, or reinstall, `partial_ref` from `source`.
    pub async fn install(&self, partial_ref: &str, source: &InstallSource) -> Result<()> {
        info!("Installing '{partial_ref}' from '{source}'");
        let cmd = self
            .command([
                "install",
                "--user",
                "--assumeyes",
                "--noninteractive",
                "--reinstall",
            ])
            .arg(source.as_arg())
            .arg(partial_ref)
            .context(format!(
                "Failed to install or reinstall '{partial_ref}' from '{source}'"
            ));
        self.runner.run_checked(&cmd).await?;
        Ok(())
    }

    /// Move an installed ref to an exact commit.
    pub async fn update_to_commit(&self, partial_ref: &str, commit: &str) -> Result<()> {
        let cmd = self
            .command([
                "update",
                "--assumeyes",
                "--noninteractive",
                "--no-related",
                "--no-deps",
            ])
            .arg(format!("--commit={commit}"))
            .arg(partial_ref)
            .context(format!("Failed to pin '{partial_ref}' to commit '{commit}'"));
        self.runner.run_checked(&cmd).await?;
        Ok(())
    }

    /// Mask (or unmask) a ref pattern so updates leave it alone.
    pub async fn mask(&self, pattern: &str, remove: bool) -> Result<()> {
        let mut cmd = self.command(["mask", "--user"]);
        if remove {
            cmd = cmd.arg("--remove");
        }
        let action = if remove { "unmask" } else { "mask" };
        let cmd = cmd.arg(pattern).context(format!("Failed to {action} '{pattern}'"));
        self.runner.run_checked(&cmd).await?;
        Ok(())
    }

    /// Synchronous unmask for use from `Drop`, where no runtime is
    /// available. Best effort.
    pub fn unmask_blocking(&self, pattern: &str) -> bool {
        let mut cmd = std::process::Command::new("flatpak");
        cmd.args(["mask", "--user", "--remove", pattern])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        for (key, value) in self.environment() {
            cmd.env(key, value);
        }
        match cmd.status() {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!("Failed to unmask '{pattern}' ({status})");
                false
            }
            Err(e) => {
                warn!("Failed to unmask '{pattern}': {e}");
                false
            }
        }
    }

    /// Print a file from inside an installed app.
    pub async fn cat_file(&self, flatpak_ref: &FlatpakRef, path: &str) -> Result<String> {
        let cmd = self
            .command([
                "run".to_string(),
                "--command=/usr/bin/cat".to_string(),
                flatpak_ref.to_string(),
                path.to_string(),
            ])
            .context(format!("Failed to extract '{path}' from '{flatpak_ref}'"));
        Ok(self.runner.run_checked(&cmd).await?.stdout)
    }

    /// Commit checksum of an installed ref.
    pub async fn installed_commit(&self, flatpak_ref: &FlatpakRef) -> Result<String> {
        let cmd = self
            .command([
                "info".to_string(),
                "--user".to_string(),
                "--show-commit".to_string(),
                flatpak_ref.to_string(),
            ])
            .context(format!("Failed to query commit of '{flatpak_ref}'"));
        Ok(self.runner.run_checked(&cmd).await?.stdout.trim().to_string())
    }

    /// Deployed files of an installed ref.
    pub fn files_dir(&self, flatpak_ref: &FlatpakRef) -> PathBuf {
        self.user_dir
            .join(flatpak_ref.kind.ref_segment())
            .join(&flatpak_ref.id)
            .join(&flatpak_ref.arch)
            .join(&flatpak_ref.branch)
            .join("active")
            .join("files")
    }
}

/// Client for the `ostree` CLI.
#[derive(Clone)]
pub struct Ostree {
    runner: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl Ostree {
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

    /// All refs in a local repository.
    pub async fn refs(&self, repo: &Path) -> Result<Vec<String>> {
        let cmd = ToolCommand::new("ostree")
            .arg(format!("--repo={}", repo.display()))
            .arg("refs")
            .timeout(self.timeout)
            .context(format!("Failed to list refs in '{}'", repo.display()));
        let out = self.runner.run_checked(&cmd).await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Branch of the first app ref in an `ostree refs` listing.
pub fn find_app_branch(refs: &[String]) -> Option<String> {
    refs.iter()
        .filter(|r| r.starts_with("app/"))
        .map(|r| r.split('/').collect::<Vec<_>>())
        .find(|parts| parts.len() >= 4)
        .and_then(|parts| parts.last().map(|b| b.to_string()))
}
