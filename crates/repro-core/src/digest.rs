//! Content digests of artifact trees.
//!
//! The digest covers, for every entry in a sorted walk: the relative path,
//! the entry type, the executable bit, symlink targets and file bytes.
//! Directory metadata (mtimes, ownership, permissions) is excluded.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Hex SHA-256 over a directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeDigest(String);

impl TreeDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for TreeDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest the tree rooted at `root`.
pub fn tree_digest(root: &Path) -> io::Result<TreeDigest> {
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("not a directory: {}", root.display()),
        ));
    }

    let mut hasher = Sha256::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(root).map_err(io::Error::other)?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            hasher.update(b"d\0");
        } else if file_type.is_symlink() {
            hasher.update(b"l\0");
            let target = std::fs::read_link(entry.path())?;
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update([0u8]);
        } else {
            let meta = entry.metadata().map_err(io::Error::other)?;
            hasher.update(if is_executable(&meta) { b"x\0" } else { b"f\0" });
            hasher.update(meta.len().to_le_bytes());
            let mut file = File::open(entry.path())?;
            io::copy(&mut file, &mut hasher)?;
        }
    }

    Ok(TreeDigest(hex::encode(hasher.finalize())))
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}
