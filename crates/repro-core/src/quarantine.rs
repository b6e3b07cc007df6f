//! Known nondeterminism quarantine.
//!
//! `manifest.json` and `share/app-info` differ between any two builds
//! (build timestamps, checksums of the build environment). They are moved
//! out of both trees before comparison and put back afterwards. The guard
//! restores on drop, so cancellation leaves the installation intact.

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::domain::FailureCause;
use crate::fs_util::{move_path, remove_path};

/// Files moved out of the compared trees.
#[derive(Debug)]
pub struct Quarantine {
    backup_dir: PathBuf,
    moved: Vec<(PathBuf, PathBuf)>,
}

impl Quarantine {
    /// Move the nondeterministic files of both trees into `backup_dir`.
    pub fn isolate(
        backup_dir: &Path,
        reference: &Path,
        candidate: &Path,
    ) -> Result<Self, FailureCause> {
        for (label, tree) in [("install", reference), ("rebuilt", candidate)] {
            if !tree.join("manifest.json").is_file() {
                let msg = format!(
                    "Failed to find manifest from {label} directory {}",
                    tree.display()
                );
                error!("{msg}");
                return Err(FailureCause::CompareToolFailure(msg));
            }
        }

        let mut quarantine = Quarantine {
            backup_dir: backup_dir.to_path_buf(),
            moved: Vec::new(),
        };

        for (label, tree) in [("install", reference), ("rebuilt", candidate)] {
            quarantine.stash(
                tree.join("manifest.json"),
                backup_dir.join(format!("{label}_manifest.json")),
            )?;
            let app_info = tree.join("share").join("app-info");
            if app_info.is_dir() {
                quarantine.stash(
                    app_info,
                    backup_dir.join(format!("{label}_app_info")).join("app-info"),
                )?;
            }
        }

        Ok(quarantine)
    }

    fn stash(&mut self, original: PathBuf, backup: PathBuf) -> Result<(), FailureCause> {
        remove_path(&backup).and_then(|()| move_path(&original, &backup)).map_err(|e| {
            FailureCause::CompareToolFailure(format!(
                "Failed to move {} aside: {e}",
                original.display()
            ))
        })?;
        self.moved.push((original, backup));
        Ok(())
    }

    /// Paths currently held aside, as `(original, backup)` pairs.
    pub fn moved(&self) -> &[(PathBuf, PathBuf)] {
        &self.moved
    }

    /// Put everything back and remove the backup directory.
    pub fn restore(mut self) {
        self.restore_all();
    }

    fn restore_all(&mut self) {
        for (original, backup) in self.moved.drain(..).rev() {
            if let Err(e) = move_path(&backup, &original) {
                warn!(
                    "Failed to restore {} from {}: {e}",
                    original.display(),
                    backup.display()
                );
            }
        }
        if self.backup_dir.is_dir() {
            let _ = std::fs::remove_dir_all(&self.backup_dir);
        }
        info!("Restored quarantined files");
    }
}

impl Drop for Quarantine {
    fn drop(&mut self) {
        if !self.moved.is_empty() {
            self.restore_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_tree(dir: &Path, manifest: &str) {
        std::fs::create_dir_all(dir.join("share/app-info/xmls")).unwrap();
        std::fs::create_dir_all(dir.join("bin")).unwrap();
        std::fs::write(dir.join("manifest.json"), manifest).unwrap();
        std::fs::write(dir.join("share/app-info/xmls/app.xml.gz"), manifest).unwrap();
        std::fs::write(dir.join("bin/app"), b"ELF").unwrap();
    }

    #[test]
    fn test_isolate_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref");
        let candidate = dir.path().join("cand");
        let backups = dir.path().join("backups");
        app_tree(&reference, "published");
        app_tree(&candidate, "rebuilt");

        let q = Quarantine::isolate(&backups, &reference, &candidate).unwrap();
        assert_eq!(q.moved().len(), 4);
        assert!(!reference.join("manifest.json").exists());
        assert!(!candidate.join("share/app-info").exists());
        assert!(reference.join("bin/app").exists());

        q.restore();
        assert_eq!(
            std::fs::read_to_string(reference.join("manifest.json")).unwrap(),
            "published"
        );
        assert_eq!(
            std::fs::read_to_string(candidate.join("share/app-info/xmls/app.xml.gz")).unwrap(),
            "rebuilt"
        );
        assert!(!backups.exists());
    }

    #[test]
    fn test_drop_restores() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref");
        let candidate = dir.path().join("cand");
        app_tree(&reference, "a");
        app_tree(&candidate, "b");

        {
            let _q = Quarantine::isolate(&dir.path().join("backups"), &reference, &candidate)
                .unwrap();
            assert!(!candidate.join("manifest.json").exists());
        }
        assert!(candidate.join("manifest.json").exists());
        assert!(reference.join("share/app-info").is_dir());
    }

    #[test]
    fn test_missing_manifest_is_compare_failure() {
        let dir = tempfile::tempdir().unwrap();
        let reference = dir.path().join("ref");
        let candidate = dir.path().join("cand");
        app_tree(&reference, "a");
        std::fs::create_dir_all(&candidate).unwrap();

        let err = Quarantine::isolate(&dir.path().join("backups"), &reference, &candidate)
            .unwrap_err();
        assert!(matches!(err, FailureCause::CompareToolFailure(_)));
        assert!(reference.join("manifest.json").exists());
    }
}
