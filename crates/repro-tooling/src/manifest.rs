//! flatpak-builder manifest inspection and rewriting.
//!
//! Published apps embed their fully resolved build manifest at
//! `/app/manifest.json`. It names the runtime, SDK and base app (with the
//! exact commits used), extensions, and every source. The manifest is kept
//! as a JSON value so that rewriting git URLs round-trips every field the
//! builder cares about.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::ToolError;
use crate::flatpak::FlatpakRef;
use crate::Result;

/// Runtimes and SDKs the checker knows how to install.
pub const ALLOWED_RUNTIMES: &[&str] = &[
    "org.freedesktop.Platform",
    "org.freedesktop.Sdk",
    "org.gnome.Platform",
    "org.gnome.Sdk",
    "org.kde.Platform",
    "org.kde.Sdk",
];

/// Branch used when an extension does not name a version.
const DEFAULT_EXTENSION_BRANCH: &str = "stable";

const GL_EXTENSION_GROUP: &str = "[Extension org.freedesktop.Platform.GL]";

static GL_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^2\d\.08$").expect("static regex"));

/// A parsed build manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    data: Map<String, Value>,
}

impl Manifest {
    /// Parse manifest JSON. The top level must be an object.
    pub fn parse(json: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(data) => Ok(Self { data }),
            _ => Err(ToolError::InvalidManifest(
                "top level is not an object".to_string(),
            )),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Load and check that the manifest belongs to `expected_id`.
    pub fn load_for(path: &Path, expected_id: &str) -> Result<Self> {
        let manifest = Self::load(path)?;
        manifest.ensure_id(expected_id)?;
        Ok(manifest)
    }

    /// The `id` field, falling back to the legacy `app-id`.
    pub fn id(&self) -> Option<&str> {
        self.str_field("id").or_else(|| self.str_field("app-id"))
    }

    pub fn ensure_id(&self, expected_id: &str) -> Result<()> {
        match self.id() {
            Some(id) if id == expected_id => Ok(()),
            other => Err(ToolError::InvalidManifest(format!(
                "The 'id' in manifest '{}' does not match the expected id '{expected_id}'",
                other.unwrap_or_default()
            ))),
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// String or number field rendered as a string.
    fn scalar_field(&self, key: &str) -> Option<String> {
        scalar(self.data.get(key)?)
    }

    fn required(&self, key: &str) -> Result<String> {
        self.scalar_field(key)
            .ok_or_else(|| ToolError::InvalidManifest(format!("missing '{key}'")))
    }

    fn allowed_runtime_ref(&self, key: &str) -> Result<String> {
        let id = self.required(key)?;
        let version = self.required("runtime-version")?;
        if !ALLOWED_RUNTIMES.contains(&id.as_str()) {
            warn!("Unknown {key} '{id}'");
            return Err(ToolError::InvalidManifest(format!("unknown {key} '{id}'")));
        }
        Ok(format!("{id}//{version}"))
    }

    /// `<runtime>//<runtime-version>`
    pub fn runtime_ref(&self) -> Result<String> {
        self.allowed_runtime_ref("runtime")
    }

    /// `<sdk>//<runtime-version>`
    pub fn sdk_ref(&self) -> Result<String> {
        self.allowed_runtime_ref("sdk")
    }

    /// `<base>//<base-version>`, when the app uses a base app.
    pub fn baseapp_ref(&self) -> Option<String> {
        let base = self.scalar_field("base")?;
        let version = self.scalar_field("base-version")?;
        Some(format!("{base}//{version}"))
    }

    pub fn sdk_extensions(&self) -> Vec<String> {
        self.data
            .get("sdk-extensions")
            .and_then(Value::as_array)
            .map(|exts| exts.iter().filter_map(scalar).collect())
            .unwrap_or_default()
    }

    /// SDK extensions on the GL base branch of the runtime.
    pub fn sdk_extension_refs(&self, gl_version: &str) -> Vec<String> {
        self.sdk_extensions()
            .into_iter()
            .map(|ext| format!("{ext}//{gl_version}"))
            .collect()
    }

    /// `add-build-extensions` at their declared version, or `stable`.
    pub fn add_build_extension_refs(&self) -> Vec<String> {
        let Some(exts) = self.data.get("add-build-extensions").and_then(Value::as_object) else {
            return Vec::new();
        };
        exts.iter()
            .map(|(id, info)| {
                let version = info
                    .get("version")
                    .and_then(scalar)
                    .unwrap_or_else(|| DEFAULT_EXTENSION_BRANCH.to_string());
                format!("{id}//{version}")
            })
            .collect()
    }

    /// Refs pinned to the exact commits of the published build, in
    /// runtime, sdk, base-app order.
    pub fn pinned_refs(&self) -> Result<Vec<(String, String)>> {
        let mut refs = vec![
            (self.runtime_ref()?, self.required("runtime-commit")?),
            (self.sdk_ref()?, self.required("sdk-commit")?),
        ];
        if let Some(base) = self.baseapp_ref() {
            refs.push((base, self.required("base-commit")?));
        }
        Ok(refs)
    }

    fn modules(&self) -> &[Value] {
        self.data
            .get("modules")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// File names of local `path`/`paths` sources that live directly next
    /// to the manifest.
    pub fn collect_src_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for_each_source(self.modules(), &mut |source| {
            if let Some(path) = source.get("path").and_then(Value::as_str) {
                push_flat_path(&mut paths, path);
            }
            if let Some(list) = source.get("paths").and_then(Value::as_array) {
                for path in list.iter().filter_map(Value::as_str) {
                    push_flat_path(&mut paths, path);
                }
            }
        });
        paths
    }

    /// Commit pinned by the first git source with `url`.
    pub fn git_commit_for(&self, url: &str) -> Option<String> {
        let mut found: Option<Option<String>> = None;
        for_each_source(self.modules(), &mut |source| {
            if found.is_none() && is_git_source_for(source, url) {
                found = Some(source.get("commit").and_then(scalar));
            }
        });
        match found {
            Some(Some(commit)) => Some(commit),
            Some(None) => {
                warn!("Git source found but no commit: {url}");
                None
            }
            None => {
                debug!("Git url not found in manifest: {url}");
                None
            }
        }
    }

    /// Point matching git sources at local checkouts. Returns the number of
    /// sources rewritten.
    pub fn replace_git_urls(&mut self, replacements: &HashMap<String, PathBuf>) -> usize {
        let file_urls: HashMap<&str, String> = replacements
            .iter()
            .map(|(url, path)| {
                let abs = std::path::absolute(path).unwrap_or_else(|_| path.clone());
                (url.as_str(), format!("file://{}", abs.display()))
            })
            .collect();

        let mut count = 0;
        if let Some(modules) = self.data.get_mut("modules").and_then(Value::as_array_mut) {
            for_each_source_mut(modules, &mut |source| {
                let target = source
                    .get("url")
                    .and_then(Value::as_str)
                    .filter(|_| source.get("type").and_then(Value::as_str) == Some("git"))
                    .and_then(|url| file_urls.get(url));
                if let Some(file_url) = target {
                    source.insert("url".to_string(), Value::String(file_url.clone()));
                    count += 1;
                }
            });
        }
        count
    }

    /// Serialize with four-space indentation.
    pub fn to_json_pretty(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.data.serialize(&mut ser)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }

    /// Rewrite git sources of the manifest file at `path` in place, keeping
    /// the original as `<path>.backup`.
    pub fn rewrite_git_sources(path: &Path, replacements: &HashMap<String, PathBuf>) -> Result<usize> {
        for checkout in replacements.values() {
            if !checkout.is_dir() {
                return Err(ToolError::InvalidManifest(format!(
                    "Target git checkout does not exist: {}",
                    checkout.display()
                )));
            }
        }

        let mut backup = path.as_os_str().to_owned();
        backup.push(".backup");
        std::fs::copy(path, &backup)?;
        info!("Created backup: {}", PathBuf::from(&backup).display());

        let mut manifest = Self::load(path)?;
        let count = manifest.replace_git_urls(replacements);
        manifest.save(path)?;
        Ok(count)
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn push_flat_path(paths: &mut Vec<String>, path: &str) {
    let trimmed = path.trim_start_matches(['.', '/']);
    if !trimmed.contains('/') {
        if let Some(name) = Path::new(path).file_name() {
            paths.push(name.to_string_lossy().into_owned());
        }
    }
}

fn is_git_source_for(source: &Map<String, Value>, url: &str) -> bool {
    source.get("type").and_then(Value::as_str) == Some("git")
        && source.get("url").and_then(Value::as_str) == Some(url)
}

fn for_each_source(modules: &[Value], f: &mut dyn FnMut(&Map<String, Value>)) {
    for module in modules.iter().filter_map(Value::as_object) {
        if let Some(sources) = module.get("sources").and_then(Value::as_array) {
            for source in sources.iter().filter_map(Value::as_object) {
                f(source);
            }
        }
        if let Some(children) = module.get("modules").and_then(Value::as_array) {
            for_each_source(children, f);
        }
    }
}

fn for_each_source_mut(modules: &mut [Value], f: &mut dyn FnMut(&mut Map<String, Value>)) {
    for module in modules.iter_mut().filter_map(Value::as_object_mut) {
        if let Some(sources) = module.get_mut("sources").and_then(Value::as_array_mut) {
            for source in sources.iter_mut().filter_map(Value::as_object_mut) {
                f(source);
            }
        }
        if let Some(children) = module.get_mut("modules").and_then(Value::as_array_mut) {
            for_each_source_mut(children, f);
        }
    }
}

/// The sources extension ref of an app: the last id component has `-`
/// replaced with `_` and `.Sources` appended.
pub fn sources_ref_for(app_id: &str, arch: &str, branch: &str) -> FlatpakRef {
    let id = match app_id.rsplit_once('.') {
        Some((head, last)) => format!("{head}.{}", last.replace('-', "_")),
        None => app_id.replace('-', "_"),
    };
    FlatpakRef::runtime(format!("{id}.Sources"), arch, branch)
}

/// GL extension base version (`2x.08`) from a runtime's metadata keyfile.
/// The last matching version wins.
pub fn parse_gl_version(metadata: &str) -> Option<String> {
    let mut in_group = false;
    let mut versions: Vec<String> = Vec::new();

    for line in metadata.lines().map(str::trim) {
        if line.starts_with('[') && line.ends_with(']') {
            in_group = line == GL_EXTENSION_GROUP;
            continue;
        }
        if !in_group {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "versions" => versions.extend(value.split(';').map(|v| v.trim().to_string())),
            "version" => versions.push(value.trim().to_string()),
            _ => {}
        }
    }

    versions.into_iter().filter(|v| GL_VERSION.is_match(v)).last()
}
