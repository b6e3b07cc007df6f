//! Environment-driven configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Architecture of the refs the checker verifies.
pub const REF_ARCH: &str = "x86_64";

/// Branch of the published reference build.
pub const REF_BRANCH: &str = "stable";

/// Branch the local rebuild is committed to.
pub const BUILD_BRANCH: &str = "repro";

/// `SOURCE_DATE_EPOCH` override passed to the build tool.
pub const SOURCE_DATE_EPOCH: &str = "1321009871";

pub const SCREENSHOTS_URL: &str = "https://dl.flathub.org/media";

const DATA_DIR_NAME: &str = "flathub_repro_checker";
const LOCK_FILE_NAME: &str = "flathub_repro_checker.lock";

/// Applications known not to build in the checker's environment.
pub const UNSUPPORTED_APP_IDS: &[&str] = &[
    "org.mozilla.firefox",
    "org.mozilla.Thunderbird",
    "net.pcsx2.PCSX2",
    "org.duckstation.DuckStation",
    "net.wz2100.wz2100",
    "com.obsproject.Studio",
];

pub fn is_unsupported_app(id: &str) -> bool {
    UNSUPPORTED_APP_IDS.contains(&id)
}

/// Filesystem layout and limits for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// `$XDG_DATA_HOME/flathub_repro_checker`
    pub data_dir: PathBuf,

    /// Private Flatpak installation (`FLATPAK_USER_DIR`).
    pub flatpak_root: PathBuf,

    /// Whether `flatpak_root` came from `FLATPAK_USER_DIR`.
    pub flatpak_root_overridden: bool,

    /// Deadline for each external command.
    pub timeout: Option<Duration>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        let data_dir = xdg_data_home().join(DATA_DIR_NAME);
        match std::env::var_os("FLATPAK_USER_DIR").filter(|v| !v.is_empty()) {
            Some(root) => CheckerConfig {
                flatpak_root: PathBuf::from(root),
                flatpak_root_overridden: true,
                data_dir,
                timeout: None,
            },
            None => CheckerConfig {
                flatpak_root: data_dir.join("flatpak_root"),
                flatpak_root_overridden: false,
                data_dir,
                timeout: None,
            },
        }
    }
}

impl CheckerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Config rooted at an explicit data directory, with the default
    /// working root inside it.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        CheckerConfig {
            flatpak_root: data_dir.join("flatpak_root"),
            flatpak_root_overridden: false,
            data_dir,
            timeout: None,
        }
    }

    /// Set per-command timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE_NAME)
    }

    pub fn builder_state_root(&self) -> PathBuf {
        self.data_dir.join("flatpak_builder_state")
    }

    pub fn builder_state_dir(&self, app_id: &str) -> PathBuf {
        self.builder_state_root()
            .join(format!("flatpak_builder_state-{app_id}"))
    }

    pub fn manifest_dir(&self, app_id: &str) -> PathBuf {
        self.data_dir.join("manifests").join(app_id)
    }

    pub fn manifest_path(&self, app_id: &str) -> PathBuf {
        self.manifest_dir(app_id).join(format!("{app_id}.json"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn build_log_path(&self, app_id: &str) -> PathBuf {
        self.data_dir.join("logs").join(app_id).join("build.log")
    }

    /// Whether the working root lives inside the data directory.
    pub fn root_inside_data_dir(&self) -> bool {
        self.flatpak_root.starts_with(&self.data_dir)
    }
}

fn xdg_data_home() -> PathBuf {
    std::env::var_os("XDG_DATA_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .unwrap_or_else(|| Path::new(".local").join("share"))
}

/// CI run information used for `log_url`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiContext {
    pub github_server_url: Option<String>,
    pub github_repository: Option<String>,
    pub github_run_id: Option<String>,
    pub ci_pipeline_url: Option<String>,
}

impl CiContext {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        CiContext {
            github_server_url: var("GITHUB_SERVER_URL"),
            github_repository: var("GITHUB_REPOSITORY"),
            github_run_id: var("GITHUB_RUN_ID"),
            ci_pipeline_url: var("CI_PIPELINE_URL"),
        }
    }

    /// GitHub Actions run URL, else the GitLab pipeline URL.
    pub fn run_url(&self) -> Option<String> {
        match (&self.github_repository, &self.github_run_id) {
            (Some(repo), Some(run_id)) => {
                let server = self
                    .github_server_url
                    .as_deref()
                    .unwrap_or("https://github.com");
                Some(format!("{server}/{repo}/actions/runs/{run_id}"))
            }
            _ => self.ci_pipeline_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_data_dir() {
        let config = CheckerConfig::with_data_dir("/data/flathub_repro_checker");
        assert_eq!(
            config.flatpak_root,
            PathBuf::from("/data/flathub_repro_checker/flatpak_root")
        );
        assert_eq!(
            config.lock_path(),
            PathBuf::from("/data/flathub_repro_checker/flathub_repro_checker.lock")
        );
        assert_eq!(
            config.builder_state_dir("org.example.App"),
            PathBuf::from(
                "/data/flathub_repro_checker/flatpak_builder_state/flatpak_builder_state-org.example.App"
            )
        );
        assert_eq!(
            config.manifest_path("org.example.App"),
            PathBuf::from("/data/flathub_repro_checker/manifests/org.example.App/org.example.App.json")
        );
        assert!(config.root_inside_data_dir());
    }

    #[test]
    fn test_unsupported_ids() {
        assert!(is_unsupported_app("org.mozilla.firefox"));
        assert!(!is_unsupported_app("org.example.App"));
    }

    #[test]
    fn test_github_run_url() {
        let ci = CiContext {
            github_repository: Some("example-org/example-repo".to_string()),
            github_run_id: Some("12345".to_string()),
            ci_pipeline_url: Some("https://gitlab.example.com/p/1".to_string()),
            ..Default::default()
        };
        assert_eq!(
            ci.run_url().as_deref(),
            Some("https://github.com/example-org/example-repo/actions/runs/12345")
        );
    }

    #[test]
    fn test_gitlab_fallback_and_none() {
        let ci = CiContext {
            github_repository: Some("example-org/example-repo".to_string()),
            ci_pipeline_url: Some("https://gitlab.example.com/p/1".to_string()),
            ..Default::default()
        };
        assert_eq!(ci.run_url().as_deref(), Some("https://gitlab.example.com/p/1"));
        assert_eq!(CiContext::default().run_url(), None);
    }
}
