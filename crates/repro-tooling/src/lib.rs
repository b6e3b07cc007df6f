//! repro-tooling: external tool plumbing for the Flathub reproducibility checker
//!
//! This crate wraps the command-line tools the checker orchestrates but never
//! reimplements: `flatpak`, `flatpak-builder`, `ostree`, `git` and
//! `diffoscope`. Every invocation goes through a [`CommandRunner`], which is
//! the seam tests use to script tool behaviour.
//!
//! ## Layer 1 - Tooling
//!
//! Focus: correct command lines, private Flatpak installations, manifest
//! inspection and rewriting.

pub mod command;
pub mod error;
pub mod fakes;
pub mod flatpak;
pub mod git;
pub mod manifest;

use std::path::{Path, PathBuf};

pub use command::{failure_detail, CommandOutput, CommandRunner, SystemRunner, ToolCommand};
pub use error::ToolError;
pub use flatpak::{
    find_app_branch, Flatpak, FlatpakRef, InstallSource, Ostree, RefKind, FLATHUB_REMOTE,
    FLATHUB_REPO_URL,
};
pub use git::{checkout_bare_mirror, file_protocol_env, fp_builder_filename_to_uri, Git};
pub use manifest::{parse_gl_version, sources_ref_for, Manifest, ALLOWED_RUNTIMES};

/// Result type for tooling operations
pub type Result<T> = std::result::Result<T, ToolError>;

/// Tools the checker cannot work without.
pub const REQUIRED_TOOLS: &[&str] = &["flatpak", "flatpak-builder", "ostree", "diffoscope", "git"];

/// Locate `program` on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// Whether `program` is on `PATH`.
pub fn is_program_available(program: &str) -> bool {
    find_program(program).is_some()
}

/// The subset of `tools` that cannot be found on `PATH`.
pub fn missing_tools<'a>(tools: &[&'a str]) -> Vec<&'a str> {
    tools
        .iter()
        .copied()
        .filter(|tool| !is_program_available(tool))
        .collect()
}

/// Whether we are running inside a Docker or Podman container.
pub fn is_inside_container() -> bool {
    Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
