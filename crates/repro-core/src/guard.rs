//! Environment guard: tool checks, the isolated working root and cleanup.
//!
//! A [`WorkingRoot`] is the explicit handle every stage receives. It holds an
//! exclusive advisory lock on the data directory for its whole lifetime and
//! releases it on drop, so every exit path (including cancellation) unlocks.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{info, warn};

use crate::config::CheckerConfig;
use crate::domain::{ReproError, Result};

/// Whether the effective user is root.
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Fail with an environment error if any of `tools` is missing.
pub fn check_tools(tools: &[&str]) -> Result<()> {
    let missing = repro_tooling::missing_tools(tools);
    if missing.is_empty() {
        return Ok(());
    }
    for tool in &missing {
        tracing::error!("'{tool}' is required but was not found in PATH");
    }
    Err(ReproError::Environment(format!(
        "required tools not found in PATH: {}",
        missing.join(", ")
    )))
}

/// Exclusive handle on the data directory and working root.
#[derive(Debug)]
pub struct WorkingRoot {
    data_dir: PathBuf,
    flatpak_root: PathBuf,
    lock_path: PathBuf,
    lock_file: Option<File>,
}

impl WorkingRoot {
    /// Create the directory layout, lock it and verify the root is writable.
    pub fn acquire(config: &CheckerConfig) -> Result<Self> {
        create_dir(&config.data_dir)?;
        create_dir(&config.builder_state_root())?;
        create_dir(&config.flatpak_root)?;
        info!("Created data directory: {}", config.data_dir.display());

        let lock_path = config.lock_path();
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| {
                ReproError::Environment(format!(
                    "cannot open lock file {}: {e}",
                    lock_path.display()
                ))
            })?;
        if let Err(e) = lock_file.try_lock_exclusive() {
            tracing::error!("Another instance is already running. Exiting");
            tracing::debug!("lock error: {e}");
            return Err(ReproError::LockHeld(lock_path));
        }
        info!("Lock acquired: {}", lock_path.display());

        let root = WorkingRoot {
            data_dir: config.data_dir.clone(),
            flatpak_root: config.flatpak_root.clone(),
            lock_path,
            lock_file: Some(lock_file),
        };
        root.probe_writable()?;
        Ok(root)
    }

    fn probe_writable(&self) -> Result<()> {
        let probe = self
            .flatpak_root
            .join(format!(".write-probe-{}", uuid::Uuid::new_v4()));
        std::fs::write(&probe, b"")
            .and_then(|()| std::fs::remove_file(&probe))
            .map_err(|e| {
                ReproError::Environment(format!(
                    "working root {} is not writable: {e}",
                    self.flatpak_root.display()
                ))
            })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn flatpak_root(&self) -> &Path {
        &self.flatpak_root
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for WorkingRoot {
    fn drop(&mut self) {
        if let Some(file) = self.lock_file.take() {
            // Unlink before unlocking: a waiting run must never lock an
            // inode that is already gone from the directory.
            if let Err(e) = std::fs::remove_file(&self.lock_path) {
                warn!("Failed to delete lockfile {}: {e}", self.lock_path.display());
            }
            if let Err(e) = FileExt::unlock(&file) {
                warn!("Failed to release lock {}: {e}", self.lock_path.display());
            }
            drop(file);
            info!("Lock released and lockfile deleted: {}", self.lock_path.display());
        }
    }
}

fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| {
        ReproError::Environment(format!("cannot create {}: {e}", path.display()))
    })
}

/// What `--cleanup` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed(PathBuf),
    NothingToClean,
}

impl CleanupOutcome {
    pub fn message(&self) -> String {
        match self {
            CleanupOutcome::Removed(dir) => format!("Cleaning up: {}", dir.display()),
            CleanupOutcome::NothingToClean => "Nothing to clean".to_string(),
        }
    }
}

/// Remove the data directory and everything the checker created in it.
/// Idempotent; refuses while another run holds the lock.
pub fn cleanup(config: &CheckerConfig) -> Result<CleanupOutcome> {
    if config.flatpak_root_overridden && !config.root_inside_data_dir() {
        warn!(
            "FLATPAK_USER_DIR is set to {}, which is outside the data directory; leaving it alone",
            config.flatpak_root.display()
        );
    }

    if !config.data_dir.is_dir() {
        return Ok(CleanupOutcome::NothingToClean);
    }

    let lock_path = config.lock_path();
    if lock_path.exists() {
        let file = OpenOptions::new().write(true).open(&lock_path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(ReproError::LockHeld(lock_path));
        }
    }

    std::fs::remove_dir_all(&config.data_dir)?;
    Ok(CleanupOutcome::Removed(config.data_dir.clone()))
}
