//! Git helpers for offline source mirrors.
//!
//! The sources extension of an app ships the bare git mirrors
//! `flatpak-builder` used for the published build. Mirrors are named after
//! their URL (`https_example.com_org_repo.git`); we turn each back into a
//! URL, clone it, and check out the commit the manifest pins.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::command::{CommandRunner, ToolCommand};
use crate::Result;

/// Suffix of the working checkout cloned from a bare mirror.
const CHECKOUT_SUFFIX: &str = "_checkout";

/// Recover the URL a `flatpak-builder` git mirror directory was named from.
///
/// The first `_` separates the scheme; every other `_` was a `/`. Names with
/// no `_` are returned unchanged.
pub fn fp_builder_filename_to_uri(name: &str) -> String {
    match name.split_once('_') {
        Some((proto, rest)) => format!("{proto}://{}", rest.replace('_', "/")),
        None => name.to_string(),
    }
}

/// Environment entries that allow `file://` git remotes for one child
/// process, without touching the user's git configuration.
pub fn file_protocol_env() -> Vec<(String, String)> {
    vec![
        ("GIT_CONFIG_COUNT".to_string(), "1".to_string()),
        ("GIT_CONFIG_KEY_0".to_string(), "protocol.file.allow".to_string()),
        ("GIT_CONFIG_VALUE_0".to_string(), "always".to_string()),
    ]
}

/// Thin client over the `git` CLI.
#[derive(Clone)]
pub struct Git {
    runner: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl Git {
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

    fn command(&self, repo: &Path) -> ToolCommand {
        ToolCommand::new("git")
            .args(["-c", "credential.interactive=false", "-C"])
            .arg(repo.to_string_lossy())
            .timeout(self.timeout)
    }

    /// `git clone <source> <dest>`, run from the source's parent.
    pub async fn clone_repo(&self, source: &Path, dest: &Path) -> Result<()> {
        let parent = source.parent().unwrap_or(source);
        let cmd = self
            .command(parent)
            .arg("clone")
            .arg(source.to_string_lossy())
            .arg(dest.to_string_lossy())
            .context(format!("Failed to clone '{}'", source.display()));
        self.runner.run_checked(&cmd).await?;
        Ok(())
    }

    /// `git checkout -f <commit>` in `repo`.
    pub async fn checkout(&self, repo: &Path, commit: &str) -> Result<()> {
        let cmd = self
            .command(repo)
            .args(["checkout", "-f", commit])
            .context(format!("Failed to check out '{commit}' in '{}'", repo.display()));
        self.runner.run_checked(&cmd).await?;
        Ok(())
    }
}

/// Clone a bare mirror into `<checkout_parent>/<mirror name>_checkout` and
/// check out `commit`. Returns the checkout path.
pub async fn checkout_bare_mirror(
    git: &Git,
    bare_repo: &Path,
    checkout_parent: &Path,
    commit: &str,
) -> Result<PathBuf> {
    let name = bare_repo
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let checkout = checkout_parent.join(format!("{name}{CHECKOUT_SUFFIX}"));

    if checkout.exists() {
        std::fs::remove_dir_all(&checkout)?;
    }

    git.clone_repo(bare_repo, &checkout).await?;
    git.checkout(&checkout, commit).await?;
    info!("Checked out {commit} from {}", bare_repo.display());
    Ok(checkout)
}
