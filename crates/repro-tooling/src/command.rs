//! External command execution with deadlines.
//!
//! Every tool the checker drives (`flatpak`, `flatpak-builder`, `ostree`,
//! `git`, `diffoscope`) goes through a [`CommandRunner`]. The system
//! implementation spawns each child in its own process group so that a
//! deadline expiry, or the caller dropping the future, takes down the whole
//! tree the tool may have forked.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::error::ToolError;
use crate::Result;

/// Lines worth surfacing from a failed tool's output.
static IMPORTANT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(error|fail|failed|failure|abort|aborted|fatal)").expect("static regex")
});

/// Number of trailing output lines scanned for error lines.
const TAIL_LINES: usize = 100;

/// A fully described invocation of an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    /// Executable name or path.
    pub program: String,

    /// Arguments, not including the program.
    pub args: Vec<String>,

    /// Working directory for the child.
    pub cwd: Option<PathBuf>,

    /// Extra environment entries layered over the inherited environment.
    pub env: Vec<(String, String)>,

    /// Deadline for the whole invocation.
    pub timeout: Option<Duration>,

    /// When set, stdout and stderr are appended to this file instead of
    /// being captured in memory.
    pub log_file: Option<PathBuf>,

    /// Human-readable description used in failure messages.
    pub context: Option<String>,
}

impl ToolCommand {
    /// Start describing an invocation of `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
            log_file: None,
            context: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn context(mut self, message: impl Into<String>) -> Self {
        self.context = Some(message.into());
        self
    }

    /// Space-joined command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Whether the argument list contains `needle` verbatim.
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

/// Result of a finished invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal).
    pub exit_code: i32,

    /// Captured stdout (empty when redirected to a log file).
    pub stdout: String,

    /// Captured stderr (empty when redirected to a log file).
    pub stderr: String,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Build a successful output carrying `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Build a failed output with the given code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Whether the tool exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into a [`ToolError::Failed`].
    pub fn into_failure(self, command: &ToolCommand) -> ToolError {
        let detail = match &command.log_file {
            Some(path) => failure_detail(&read_tail(path), ""),
            None => failure_detail(&self.stdout, &self.stderr),
        };
        let context = command
            .context
            .clone()
            .unwrap_or_else(|| format!("Command failed: {}", command.display()));
        error!(code = self.exit_code, "{context}");
        ToolError::Failed {
            context,
            code: self.exit_code,
            detail,
        }
    }
}

/// Pick the error-looking lines out of the tail of `stdout`, falling back to
/// the trimmed stderr.
pub fn failure_detail(stdout: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stdout.lines().collect();
    let tail = &lines[lines.len().saturating_sub(TAIL_LINES)..];
    let important: Vec<&str> = tail
        .iter()
        .map(|l| l.trim())
        .filter(|l| IMPORTANT_LINE.is_match(l))
        .collect();

    let stderr = stderr.trim();
    match (important.is_empty(), stderr.is_empty()) {
        (true, _) => stderr.to_string(),
        (false, true) => important.join("\n"),
        (false, false) => format!("{}\n{stderr}", important.join("\n")),
    }
}

fn read_tail(path: &Path) -> String {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Executes [`ToolCommand`]s.
///
/// This is the seam between the pipeline and the outside world: tests swap
/// in a scripted implementation that returns canned outputs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. A non-zero exit is *not* an error here.
    async fn run(&self, command: &ToolCommand) -> Result<CommandOutput>;

    /// Run the command and turn a non-zero exit into [`ToolError::Failed`].
    async fn run_checked(&self, command: &ToolCommand) -> Result<CommandOutput> {
        let output = self.run(command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(output.into_failure(command))
        }
    }
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &ToolCommand) -> Result<CommandOutput> {
        if command.program.is_empty() {
            return Err(ToolError::EmptyCommand);
        }

        let start = Instant::now();
        match &command.cwd {
            Some(dir) => info!("Running: {} in directory: {}", command.display(), dir.display()),
            None => info!("Running: {}", command.display()),
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        isolate_process_group(&mut cmd);

        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        match &command.log_file {
            Some(path) => {
                let log = open_log(path)?;
                cmd.stdout(Stdio::from(log.try_clone()?))
                    .stderr(Stdio::from(log));
            }
            None => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        let child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ToolError::NotFound(command.program.clone())
            } else {
                ToolError::Spawn {
                    program: command.program.clone(),
                    source,
                }
            }
        })?;

        // Armed until the child has been reaped; dropping the future early
        // (deadline or cancellation) kills the whole group.
        let mut group = GroupKillGuard::new(child.id());

        let output = match command.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => {
                    error!(
                        "'{}' timed out after {}s, killing process group",
                        command.program,
                        limit.as_secs()
                    );
                    return Err(ToolError::Timeout {
                        program: command.program.clone(),
                        limit,
                    });
                }
            },
            None => child.wait_with_output().await?,
        };
        group.disarm();

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(program = %command.program, exit_code, duration_ms, "command finished");

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
        })
    }
}

fn open_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Kills a child's process group when dropped while still armed.
struct GroupKillGuard {
    pgid: Option<u32>,
}

impl GroupKillGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKillGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
#[allow(clippy::cast_possible_wrap)]
fn kill_process_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        debug!(pgid, "killpg failed: {e}");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_joins_program_and_args() {
        let cmd = ToolCommand::new("flatpak")
            .args(["install", "--user"])
            .arg("flathub");
        assert_eq!(cmd.display(), "flatpak install --user flathub");
        assert!(cmd.has_arg("--user"));
        assert!(!cmd.has_arg("--system"));
    }

    #[test]
    fn test_failure_detail_prefers_error_lines() {
        let stdout = "Downloading sources\nerror: module foo failed\nDone\nFATAL: disk full";
        let detail = failure_detail(stdout, "");
        assert_eq!(detail, "error: module foo failed\nFATAL: disk full");
    }

    #[test]
    fn test_failure_detail_falls_back_to_stderr() {
        assert_eq!(failure_detail("all good", "  boom \n"), "boom");
        assert_eq!(failure_detail("", ""), "");
    }

    #[test]
    fn test_failure_detail_only_scans_tail() {
        let mut stdout = String::from("error: ancient\n");
        for i in 0..TAIL_LINES {
            stdout.push_str(&format!("line {i}\n"));
        }
        assert_eq!(failure_detail(&stdout, ""), "");
    }

    #[test]
    fn test_into_failure_uses_context() {
        let cmd = ToolCommand::new("ostree").arg("refs").context("Failed to list refs");
        let err = CommandOutput::failed(1, "no such repo").into_failure(&cmd);
        match err {
            ToolError::Failed { context, code, detail } => {
                assert_eq!(context, "Failed to list refs");
                assert_eq!(code, 1);
                assert_eq!(detail, "no such repo");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let cmd = ToolCommand::new("echo").arg("hello");
        let out = SystemRunner.run(&cmd).await.expect("execute failed");
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let cmd = ToolCommand::new("false");
        let out = SystemRunner.run(&cmd).await.expect("execute failed");
        assert!(!out.success());

        let err = SystemRunner.run_checked(&cmd).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_not_found() {
        let cmd = ToolCommand::new("definitely-not-a-real-tool-4242");
        let err = SystemRunner.run(&cmd).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let cmd = ToolCommand::new("sleep")
            .arg("30")
            .timeout(Some(Duration::from_millis(200)));
        let started = Instant::now();
        let err = SystemRunner.run(&cmd).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_log_file_receives_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("build.log");
        let cmd = ToolCommand::new("sh")
            .args(["-c", "echo building; echo 'error: broken' >&2; exit 3"])
            .log_to(&log);

        let out = SystemRunner.run(&cmd).await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.stdout.is_empty());

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("building"));
        assert!(contents.contains("error: broken"));

        match out.into_failure(&cmd) {
            ToolError::Failed { detail, .. } => assert_eq!(detail, "error: broken"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
