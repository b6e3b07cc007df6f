//! Application identifiers and check targets.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use repro_tooling::{FlatpakRef, RefKind};
use serde::{Deserialize, Serialize};

use super::error::ReproError;

const MAX_ID_LEN: usize = 255;
const MIN_COMPONENTS: usize = 3;

/// A validated reverse-DNS application id such as `org.example.App`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApplicationId(String);

impl ApplicationId {
    /// Validate `id` against the Flatpak naming rules.
    pub fn parse(id: &str) -> Result<Self, ReproError> {
        let invalid = |reason: &str| ReproError::InvalidAppId {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        if id.is_empty() || id.len() > MAX_ID_LEN {
            return Err(invalid("must be between 1 and 255 characters"));
        }

        let components: Vec<&str> = id.split('.').collect();
        if components.len() < MIN_COMPONENTS {
            return Err(invalid("must contain at least 3 components"));
        }

        let last = components.len() - 1;
        for (i, component) in components.iter().enumerate() {
            let Some(first) = component.chars().next() else {
                return Err(invalid("components must not be empty"));
            };
            if first.is_ascii_digit() {
                return Err(invalid("components must not start with a digit"));
            }
            let dash_ok = i == last;
            if !component
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || (dash_ok && c == '-'))
            {
                return Err(invalid("contains invalid characters"));
            }
        }

        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `diffoscope_result-<id>`, relative to the working directory.
    pub fn default_output_dir(&self) -> PathBuf {
        PathBuf::from(format!("diffoscope_result-{}", self.0))
    }

    /// The app ref for this id.
    pub fn app_ref(&self, arch: &str, branch: &str) -> FlatpakRef {
        FlatpakRef::app(self.0.as_str(), arch, branch)
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ApplicationId {
    type Err = ReproError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ApplicationId {
    type Error = ReproError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ApplicationId> for String {
    fn from(id: ApplicationId) -> Self {
        id.0
    }
}

/// What the user asked to check: a bare id, or a full ref whose kind is
/// already known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTarget {
    pub id: ApplicationId,
    pub kind: Option<RefKind>,
}

impl CheckTarget {
    /// A bare id whose ref kind is probed during resolution.
    pub fn app(id: ApplicationId) -> Self {
        Self { id, kind: None }
    }
}

impl FromStr for CheckTarget {
    type Err = ReproError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains('/') {
            let parsed: FlatpakRef = s.parse().map_err(|e: repro_tooling::ToolError| {
                ReproError::InvalidAppId {
                    id: s.to_string(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Self {
                id: ApplicationId::parse(&parsed.id)?,
                kind: Some(parsed.kind),
            })
        } else {
            Ok(Self::app(ApplicationId::parse(s)?))
        }
    }
}
