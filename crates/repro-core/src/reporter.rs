//! Classification of a finished run into a result record and exit code.

use std::io::Write;
use std::path::Path;

use tracing::{error, info};

use crate::config::CiContext;
use crate::domain::{ComparisonResult, Result, ResultRecord, StatusCode};

/// How the run reports its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Outcome via logging; the exit code carries the status.
    #[default]
    Human,
    /// One JSON record on stdout; the exit code is 0 whenever a record is
    /// produced.
    Json,
}

/// Pick `log_url`: CI run URL, then the uploaded build log, then the local
/// build log if it exists.
pub fn resolve_log_url(
    ci: &CiContext,
    uploaded_log: Option<&str>,
    local_log: Option<&Path>,
) -> String {
    if let Some(url) = ci.run_url() {
        return url;
    }
    if let Some(url) = uploaded_log {
        return url.to_string();
    }
    local_log
        .filter(|p| p.is_file())
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

/// Build the record for a terminal outcome.
pub fn build_record(
    app_id: &str,
    result: &ComparisonResult,
    log_url: String,
    result_url: Option<String>,
) -> ResultRecord {
    ResultRecord::new(app_id, result.status_code(), result.message())
        .with_log_url(log_url)
        .with_result_url(result_url.unwrap_or_default())
}

/// One-line outcome for human output: failures carry their stage.
pub fn human_summary(result: &ComparisonResult) -> String {
    match result {
        ComparisonResult::Failed { stage, cause } => format!("Failed at {stage} stage: {cause}"),
        other => other.message(),
    }
}

fn log_record(record: &ResultRecord, summary: &str) {
    match record.status() {
        Some(StatusCode::Failure) | None => error!("{summary}"),
        Some(_) => info!("{summary}"),
    }
    if !record.result_url.is_empty() {
        info!("Result: {}", record.result_url);
    }
    if !record.log_url.is_empty() {
        info!("Log: {}", record.log_url);
    }
}

/// Emits records and maps them to process exit codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reporter {
    mode: OutputMode,
}

impl Reporter {
    pub fn new(mode: OutputMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Write the record to `out` in JSON mode, or log it otherwise.
    pub fn emit(&self, record: &ResultRecord, out: &mut dyn Write) -> Result<()> {
        match self.mode {
            OutputMode::Json => record.write_to(out),
            OutputMode::Human => {
                log_record(record, &record.message);
                Ok(())
            }
        }
    }

    /// Like [`emit`](Self::emit), but human output names the stage a failed
    /// run stopped at.
    pub fn emit_result(
        &self,
        result: &ComparisonResult,
        record: &ResultRecord,
        out: &mut dyn Write,
    ) -> Result<()> {
        match self.mode {
            OutputMode::Json => record.write_to(out),
            OutputMode::Human => {
                log_record(record, &human_summary(result));
                Ok(())
            }
        }
    }

    pub fn exit_code(&self, record: &ResultRecord) -> u8 {
        match self.mode {
            OutputMode::Json => 0,
            OutputMode::Human => record
                .status()
                .unwrap_or(StatusCode::Failure)
                .exit_code(),
        }
    }
}
