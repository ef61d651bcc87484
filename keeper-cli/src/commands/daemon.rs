//! `keeper daemon`: foreground run, background launch, key lookup.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;

use keeper_core::{possession::read_key, DaemonRunConfig};
use keeper_daemon::launch::{child_args, launch_and_wait, BackgroundLaunchOutcome, ReadinessStrategy};
use keeper_daemon::{paths, start_blocking, DaemonError, DaemonSettings, FORCE_HINT};

/// Exit code when another live daemon owns the machine.
pub const EXIT_ALREADY_RUNNING: u8 = 3;

#[derive(Args, Debug, Default)]
pub struct DaemonArgs {
    /// Run only core services.
    #[arg(short, long)]
    pub minimal: bool,

    /// Verbose logging on the console.
    #[arg(short, long)]
    pub debug: bool,

    /// Start detached and return once the daemon reports readiness.
    #[arg(short, long)]
    pub background: bool,

    /// Terminate any existing daemon and take over.
    #[arg(short, long)]
    pub force: bool,

    /// Print the current daemon key and exit.
    #[arg(long)]
    pub get_key: bool,
}

impl DaemonArgs {
    pub fn config(&self) -> DaemonRunConfig {
        DaemonRunConfig::new(self.debug, self.minimal)
    }

    pub fn run(self) -> Result<ExitCode> {
        if self.get_key {
            return print_key();
        }
        if self.background {
            return run_background();
        }
        run_foreground(DaemonSettings::from_env(self.config(), self.force))
    }
}

fn print_key() -> Result<ExitCode> {
    let lock_path = paths::lock_path();
    let key = read_key(&lock_path)
        .with_context(|| format!("no daemon key at {}", lock_path.display()))?;
    println!("{key}");
    Ok(ExitCode::SUCCESS)
}

fn run_foreground(settings: DaemonSettings) -> Result<ExitCode> {
    match start_blocking(settings) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => Ok(report_failure(&err)),
    }
}

/// Prints a startup failure and maps it to an exit code.
fn report_failure(err: &DaemonError) -> ExitCode {
    eprintln!("keeper: {err}");
    if err.suggests_force() {
        eprintln!("{FORCE_HINT}");
    }
    if err.is_contention() {
        ExitCode::from(EXIT_ALREADY_RUNNING)
    } else {
        ExitCode::FAILURE
    }
}

fn run_background() -> Result<ExitCode> {
    let program = std::env::current_exe().context("could not locate the keeper executable")?;
    let args = child_args(std::env::args_os().skip(1));
    let outcome = launch_and_wait(&program, &args, ReadinessStrategy::from_env())
        .context("failed to launch background daemon")?;
    Ok(report_outcome(&outcome))
}

fn report_outcome(outcome: &BackgroundLaunchOutcome) -> ExitCode {
    match outcome {
        BackgroundLaunchOutcome::Started { port } => {
            println!("Running at {}", port.unwrap_or_else(paths::port));
            ExitCode::SUCCESS
        }
        BackgroundLaunchOutcome::AlreadyRunning { port } => {
            println!("Already running at {}", port.unwrap_or_else(paths::port));
            eprintln!("{FORCE_HINT}");
            ExitCode::from(EXIT_ALREADY_RUNNING)
        }
        BackgroundLaunchOutcome::Failed(reason) => {
            eprintln!("keeper: daemon failed to start: {reason}");
            ExitCode::FAILURE
        }
    }
}
