//! Flathub reproducibility checker CLI
//!
//! `flathub-repro-checker --appid <ID>` installs the published build of an
//! app, rebuilds it and reports whether the two are identical.
//!
//! Exit codes: 0 reproducible, 42 unreproducible, 1 failure, 130 interrupted.
//! With `--json` exactly one record is printed to stdout and the exit code
//! is 0 whenever a record was produced.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use repro_core::{
    cleanup, default_level, init_tracing, is_root, CheckReport, CheckRequest, CheckTarget,
    Checker, CheckerConfig, ObjectStore, OutputMode, Reporter, ResultRecord, S3Store,
    StatusCode,
};
use repro_tooling::SystemRunner;
use tracing::{error, warn};

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "flathub-repro-checker")]
#[command(author = "Flathub Infra")]
#[command(version = repro_core::VERSION)]
#[command(about = "Check whether a Flathub application builds reproducibly", long_about = None)]
struct Cli {
    /// Application ID (or full app ref) to check
    #[arg(long)]
    appid: Option<String>,

    /// Local OSTree repo to install the reference build from instead of Flathub
    #[arg(long)]
    ref_build_path: Option<PathBuf>,

    /// Directory for the diffoscope report (default: ./diffoscope_result-<appid>)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Print a single JSON result record to stdout
    #[arg(long)]
    json: bool,

    /// Upload the diffoscope report and build log to S3
    #[arg(long)]
    upload_result: bool,

    /// Treat upload failures as check failures
    #[arg(long, requires = "upload_result")]
    strict_upload: bool,

    /// Timeout in seconds for each external command
    #[arg(long, env = "REPRO_CHECKER_TIMEOUT", value_name = "SECS")]
    timeout: Option<u64>,

    /// Remove the checker's data directory and exit
    #[arg(long)]
    cleanup: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        if self.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(false, default_level(cli.verbose, cli.json));

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let reporter = Reporter::new(cli.output_mode());

    if is_root() {
        return emit(
            &reporter,
            &ResultRecord::new("", StatusCode::Failure, "Running the checker as root is unsupported"),
        );
    }

    let config = CheckerConfig::from_env().with_timeout(cli.timeout.map(Duration::from_secs));

    if cli.cleanup {
        return emit(&reporter, &cleanup_record(&config));
    }

    let Some(appid) = cli.appid.as_deref() else {
        return emit(
            &reporter,
            &ResultRecord::new("", StatusCode::Failure, "--appid is required"),
        );
    };
    let target: CheckTarget = match appid.parse() {
        Ok(target) => target,
        Err(e) => {
            return emit(
                &reporter,
                &ResultRecord::new(appid, StatusCode::Failure, e.to_string()),
            )
        }
    };

    let mut request = CheckRequest::new(target)
        .with_upload(cli.upload_result, cli.strict_upload);
    if let Some(dir) = &cli.output_dir {
        request = request.with_output_dir(dir);
    }
    if let Some(path) = &cli.ref_build_path {
        request = request.with_ref_build_path(path);
    }

    let mut checker = Checker::new(Arc::new(SystemRunner::new()), config);
    if cli.upload_result {
        match S3Store::from_env() {
            Ok(store) => {
                let store: Arc<dyn ObjectStore> = Arc::new(store);
                checker = checker.with_store(store);
            }
            Err(e) => warn!("Result upload disabled: {e}"),
        }
    }

    tokio::select! {
        report = checker.check(&request) => {
            let report = report?;
            emit_report(&reporter, &report)
        }
        _ = tokio::signal::ctrl_c() => {
            error!("Interrupted, cleaning up");
            Ok(EXIT_INTERRUPTED)
        }
    }
}

/// Emit a finished check; human output names the failed stage.
fn emit_report(reporter: &Reporter, report: &CheckReport) -> Result<u8> {
    write_stdout(|out| reporter.emit_result(&report.result, &report.record, out))?;
    Ok(reporter.exit_code(&report.record))
}

/// Run `--cleanup` and describe the outcome as a record.
fn cleanup_record(config: &CheckerConfig) -> ResultRecord {
    match cleanup(config) {
        Ok(outcome) => ResultRecord::new("", StatusCode::Success, outcome.message()),
        Err(e) => ResultRecord::new("", StatusCode::Failure, format!("Cleanup failed: {e}")),
    }
}

/// Emit the record and return the exit code for it.
fn emit(reporter: &Reporter, record: &ResultRecord) -> Result<u8> {
    write_stdout(|out| reporter.emit(record, out))?;
    Ok(reporter.exit_code(record))
}

fn write_stdout(write: impl FnOnce(&mut dyn Write) -> repro_core::Result<()>) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    write(&mut out).context("Failed to write result record")?;
    out.flush().context("Failed to write result record")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use repro_core::WorkingRoot;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_full_invocation() {
        let cli = Cli::try_parse_from([
            "flathub-repro-checker",
            "--appid",
            "org.example.App",
            "--ref-build-path",
            "/srv/repo",
            "--output-dir",
            "out",
            "--json",
            "--upload-result",
            "--strict-upload",
            "--timeout",
            "600",
            "-v",
        ])
        .unwrap();

        assert_eq!(cli.appid.as_deref(), Some("org.example.App"));
        assert_eq!(cli.ref_build_path, Some(PathBuf::from("/srv/repo")));
        assert_eq!(cli.timeout, Some(600));
        assert!(cli.json && cli.upload_result && cli.strict_upload && cli.verbose);
        assert_eq!(cli.output_mode(), OutputMode::Json);
    }

    #[test]
    fn test_strict_upload_requires_upload() {
        let err = Cli::try_parse_from([
            "flathub-repro-checker",
            "--appid",
            "org.example.App",
            "--strict-upload",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn test_appid_is_optional_at_parse_time() {
        let cli = Cli::try_parse_from(["flathub-repro-checker", "--cleanup"]).unwrap();
        assert!(cli.cleanup);
        assert!(cli.appid.is_none());
        assert_eq!(cli.output_mode(), OutputMode::Human);
    }

    #[test]
    fn test_cleanup_record_reports_removed_then_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckerConfig::with_data_dir(dir.path().join("data"));
        std::fs::create_dir_all(&config.flatpak_root).unwrap();

        let first = cleanup_record(&config);
        assert_eq!(first.status(), Some(StatusCode::Success));
        assert!(first.message.starts_with("Cleaning up: "));
        assert!(!config.data_dir.exists());

        let second = cleanup_record(&config);
        assert_eq!(second.status(), Some(StatusCode::Success));
        assert_eq!(second.message, "Nothing to clean");
        assert_eq!(second.appid, "");
    }

    #[test]
    fn test_cleanup_record_while_locked_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckerConfig::with_data_dir(dir.path().join("data"));
        let _held = WorkingRoot::acquire(&config).unwrap();

        let record = cleanup_record(&config);
        assert_eq!(record.status(), Some(StatusCode::Failure));
        assert!(record.message.starts_with("Cleanup failed: "));
        assert!(config.data_dir.exists());

        let reporter = Reporter::new(OutputMode::Json);
        let mut out = Vec::new();
        reporter.emit(&record, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["status_code"], "1");
        assert_eq!(reporter.exit_code(&record), 0);
    }
}
