//! Background Launch Coordinator.
//!
//! `keeper daemon --background` re-executes itself without `--background` as
//! a detached child and reports what became of it. Readiness is read from the
//! child's stdout: the first line starting with [`RUNNING_PREFIX`] or
//! [`ALREADY_RUNNING_PREFIX`] decides the outcome. Anything else the child
//! prints first is tolerated.
//!
//! On macOS the default is [`ReadinessStrategy::FixedDelay`] instead: the
//! launcher waits [`FIXED_DELAY`] and assumes success if the child is still
//! running. A child that found another instance exits within the delay and
//! is reported as a failed start rather than as already running.
//! `KEEPER_READINESS=stdout` or `=delay` overrides the platform default.

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::LaunchError;
use crate::paths::READINESS_ENV;

pub const RUNNING_PREFIX: &str = "Running at ";
pub const ALREADY_RUNNING_PREFIX: &str = "Already running at ";

pub const READINESS_TIMEOUT: Duration = Duration::from_secs(20);
pub const MAX_PRELUDE_LINES: usize = 200;
pub const FIXED_DELAY: Duration = Duration::from_secs(2);

/// Lines of child output kept for failure reports.
const TAIL_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundLaunchOutcome {
    /// The child owns the daemon role. `port` is `None` when readiness was
    /// assumed rather than reported.
    Started { port: Option<u16> },
    /// The child found a live daemon and exited.
    AlreadyRunning { port: Option<u16> },
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessStrategy {
    /// Scan the child's stdout for a sentinel line.
    CaptureStdout { timeout: Duration, max_lines: usize },
    /// Wait a fixed delay and report success if the child is still running.
    FixedDelay(Duration),
}

impl Default for ReadinessStrategy {
    #[cfg(target_os = "macos")]
    fn default() -> Self {
        ReadinessStrategy::FixedDelay(FIXED_DELAY)
    }

    #[cfg(not(target_os = "macos"))]
    fn default() -> Self {
        Self::capture_stdout()
    }
}

impl ReadinessStrategy {
    pub fn capture_stdout() -> Self {
        ReadinessStrategy::CaptureStdout {
            timeout: READINESS_TIMEOUT,
            max_lines: MAX_PRELUDE_LINES,
        }
    }

    /// `KEEPER_READINESS` picks `stdout` or `delay`; anything else keeps the
    /// platform default.
    pub fn from_env() -> Self {
        Self::from_value(std::env::var(READINESS_ENV).ok().as_deref())
    }

    pub fn from_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("delay") => ReadinessStrategy::FixedDelay(FIXED_DELAY),
            Some(v) if v.eq_ignore_ascii_case("stdout") => Self::capture_stdout(),
            _ => ReadinessStrategy::default(),
        }
    }
}

/// Arguments for the child: the parent's arguments minus the background flag.
///
/// Clustered short flags such as `-db` lose only the `b`.
pub fn child_args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut out = Vec::new();
    for arg in args {
        let arg = arg.as_ref();
        match arg.to_str() {
            Some("--background") => {}
            Some(short) if is_short_cluster(short) && short.contains('b') => {
                let rest: String = short[1..].chars().filter(|c| *c != 'b').collect();
                if !rest.is_empty() {
                    out.push(OsString::from(format!("-{rest}")));
                }
            }
            _ => out.push(arg.to_os_string()),
        }
    }
    out
}

fn is_short_cluster(arg: &str) -> bool {
    arg.len() > 1
        && arg.starts_with('-')
        && !arg.starts_with("--")
        && arg[1..].chars().all(|c| c.is_ascii_alphabetic())
}

/// Maps one stdout line to a decisive outcome, if it is a sentinel.
pub fn classify_line(line: &str) -> Option<BackgroundLaunchOutcome> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(ALREADY_RUNNING_PREFIX) {
        return Some(BackgroundLaunchOutcome::AlreadyRunning {
            port: rest.trim().parse().ok(),
        });
    }
    line.strip_prefix(RUNNING_PREFIX)
        .map(|rest| BackgroundLaunchOutcome::Started {
            port: rest.trim().parse().ok(),
        })
}

/// Reads lines until a sentinel, end of stream, `max_lines` non-sentinel
/// lines, or `timeout`. Only a sentinel yields a non-`Failed` outcome.
pub async fn scan_readiness<R>(reader: R, timeout: Duration, max_lines: usize) -> BackgroundLaunchOutcome
where
    R: AsyncBufRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let scanned = tokio::time::timeout(timeout, scan_lines(reader, max_lines, &mut tail)).await;
    match scanned {
        Ok(outcome) => outcome,
        Err(_) => BackgroundLaunchOutcome::Failed(with_tail(
            format!("daemon did not report readiness within {}s", timeout.as_secs()),
            &tail,
        )),
    }
}

async fn scan_lines<R>(mut reader: R, max_lines: usize, tail: &mut VecDeque<String>) -> BackgroundLaunchOutcome
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let mut seen = 0usize;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                return BackgroundLaunchOutcome::Failed(with_tail(
                    "daemon exited before reporting readiness".to_string(),
                    tail,
                ))
            }
            Ok(_) => {}
            Err(err) => {
                return BackgroundLaunchOutcome::Failed(with_tail(
                    format!("failed to read daemon output: {err}"),
                    tail,
                ))
            }
        }

        let line = String::from_utf8_lossy(&buf);
        if let Some(outcome) = classify_line(&line) {
            return outcome;
        }
        tracing::debug!(line = %line.trim_end(), "daemon output before readiness");
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.trim_end().to_string());
        seen += 1;
        if seen >= max_lines {
            return BackgroundLaunchOutcome::Failed(with_tail(
                format!("no readiness line within the first {max_lines} lines"),
                tail,
            ));
        }
    }
}

fn with_tail(reason: String, tail: &VecDeque<String>) -> String {
    if tail.is_empty() {
        return reason;
    }
    let lines: Vec<&str> = tail.iter().map(String::as_str).collect();
    format!("{reason}; last output: {}", lines.join(" | "))
}

/// Spawns `program args` detached and waits for its readiness according to
/// `strategy`. The child is never waited on or killed; it outlives this
/// process when it started successfully.
pub fn launch_and_wait(
    program: &Path,
    args: &[OsString],
    strategy: ReadinessStrategy,
) -> Result<BackgroundLaunchOutcome, LaunchError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(LaunchError::Runtime)?;
    runtime.block_on(launch(program, args, strategy))
}

async fn launch(
    program: &Path,
    args: &[OsString],
    strategy: ReadinessStrategy,
) -> Result<BackgroundLaunchOutcome, LaunchError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    command.process_group(0);

    match strategy {
        ReadinessStrategy::CaptureStdout { timeout, max_lines } => {
            command.stdout(Stdio::piped());
            let mut child = spawn(&mut command, program)?;
            let stdout = child.stdout.take().ok_or(LaunchError::NoStdout)?;
            let outcome = scan_readiness(BufReader::new(stdout), timeout, max_lines).await;
            tracing::debug!(pid = ?child.id(), ?outcome, "background launch finished");
            Ok(outcome)
        }
        ReadinessStrategy::FixedDelay(delay) => {
            command.stdout(Stdio::null());
            let mut child = spawn(&mut command, program)?;
            tokio::time::sleep(delay).await;
            match child.try_wait() {
                Ok(None) => Ok(BackgroundLaunchOutcome::Started { port: None }),
                Ok(Some(status)) => Ok(BackgroundLaunchOutcome::Failed(format!(
                    "daemon exited during startup ({status})"
                ))),
                Err(err) => Ok(BackgroundLaunchOutcome::Failed(format!(
                    "could not check daemon status: {err}"
                ))),
            }
        }
    }
}

fn spawn(command: &mut Command, program: &Path) -> Result<tokio::process::Child, LaunchError> {
    let child = command.spawn().map_err(|source| LaunchError::Spawn {
        program: program.to_path_buf(),
        source,
    })?;
    tracing::info!(pid = ?child.id(), program = %program.display(), "spawned background daemon");
    Ok(child)
}
