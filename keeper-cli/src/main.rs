//! Keeper: single-instance local daemon hosting editor-facing services.
//!
//! # Usage
//!
//! ```text
//! keeper daemon [--minimal] [--debug] [--background] [--force] [--get-key]
//! keeper status
//! keeper stop
//! ```
//!
//! Exit codes: `0` success, `1` failure, `3` another daemon already owns the
//! machine.

mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::daemon::DaemonArgs;

#[derive(Parser, Debug)]
#[command(
    name = "keeper",
    version,
    about = "Run and control the keeper daemon (default endpoint 127.0.0.1:12122)",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the daemon, or print its key with --get-key.
    Daemon(DaemonArgs),

    /// Query the running daemon's status as JSON.
    Status,

    /// Ask the running daemon to shut down.
    Stop,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Daemon(args) => args.run(),
        Commands::Status => commands::control::status(),
        Commands::Stop => commands::control::stop(),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("keeper: {err:#}");
            ExitCode::FAILURE
        }
    }
}
