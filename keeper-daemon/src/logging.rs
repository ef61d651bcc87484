//! Tracing setup for the daemon process.
//!
//! Console output goes to stderr so stdout stays reserved for the readiness
//! line. Without `--debug` the console only shows warnings and errors; the
//! log file, when there is one, always gets the full filter.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::log_rotation;

/// Installs the global subscriber. A subscriber that is already installed
/// (tests, embedding) is left alone.
pub fn init_tracing(debug: bool, log_file: Option<&Path>) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let console_level = if debug { Level::TRACE } else { Level::WARN };

    let console = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr.with_max_level(console_level));

    let file = log_file.and_then(|path| match open_log(path) {
        Ok(file) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        ),
        Err(err) => {
            eprintln!("keeper: cannot open log file {}: {err}", path.display());
            None
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();
}

fn open_log(path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    log_rotation::rotate_daemon_log(path);
    OpenOptions::new().create(true).append(true).open(path)
}
