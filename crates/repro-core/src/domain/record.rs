//! The result record consumed by the reproducibility dashboard.
//!
//! Field names and types are a compatibility contract: every field is a
//! string and none may be renamed.

use std::io::Write;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::error::{ReproError, Result};
use super::outcome::StatusCode;

/// One terminal record per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// ISO-8601 UTC timestamp with offset.
    pub timestamp: String,

    /// Application id, empty on very early failures.
    pub appid: String,

    /// One of `"0"`, `"42"`, `"1"`.
    pub status_code: String,

    pub log_url: String,

    pub result_url: String,

    pub message: String,
}

impl ResultRecord {
    /// Create a record stamped with the current time and empty URLs.
    pub fn new(appid: impl Into<String>, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            appid: appid.into(),
            status_code: status.as_str().to_string(),
            log_url: String::new(),
            result_url: String::new(),
            message: message.into(),
        }
    }

    pub fn with_log_url(mut self, url: impl Into<String>) -> Self {
        self.log_url = url.into();
        self
    }

    pub fn with_result_url(mut self, url: impl Into<String>) -> Self {
        self.result_url = url.into();
        self
    }

    /// Parsed status code, if it is one of the known values.
    pub fn status(&self) -> Option<StatusCode> {
        self.status_code
            .parse::<i32>()
            .ok()
            .and_then(|c| StatusCode::try_from(c).ok())
    }

    /// Serialize as a JSON object indented with four spaces.
    pub fn to_json_pretty(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Write the record followed by a newline and flush.
    pub fn write_to(&self, out: &mut dyn Write) -> Result<()> {
        let json = self.to_json_pretty()?;
        writeln!(out, "{json}").map_err(ReproError::RecordWrite)?;
        out.flush().map_err(ReproError::RecordWrite)
    }
}
