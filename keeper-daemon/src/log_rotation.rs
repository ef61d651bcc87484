//! Size-based rotation of `daemon.log`, checked once before the log is
//! opened for appending.
//!
//! `daemon.log` becomes `daemon.log.1`; older copies shift up by one and the
//! copy past [`LogRotation::keep`] is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotation {
    /// Rotate once the live log reaches this size.
    pub max_bytes: u64,
    /// Rotated copies kept next to the live log.
    pub keep: usize,
}

impl Default for LogRotation {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            keep: 5,
        }
    }
}

impl LogRotation {
    /// Moves `log` aside when it is too large. Returns whether it did.
    ///
    /// The live file is not recreated; the next append open creates it.
    pub fn apply(&self, log: &Path) -> io::Result<bool> {
        match fs::metadata(log) {
            Ok(meta) if meta.len() >= self.max_bytes => {}
            Ok(_) => return Ok(false),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        }
        if self.keep == 0 {
            fs::remove_file(log)?;
            return Ok(true);
        }

        ignore_missing(fs::remove_file(backup_path(log, self.keep)))?;
        for n in (1..self.keep).rev() {
            ignore_missing(fs::rename(backup_path(log, n), backup_path(log, n + 1)))?;
        }
        fs::rename(log, backup_path(log, 1))?;
        Ok(true)
    }
}

/// Rotates the daemon log with the default policy.
///
/// Failures are reported on stderr and never block startup; tracing is not
/// installed yet when this runs.
pub fn rotate_daemon_log(log: &Path) {
    if let Err(err) = LogRotation::default().apply(log) {
        eprintln!("keeper: log rotation failed for {}: {err}", log.display());
    }
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// `daemon.log` -> `daemon.log.<n>`.
fn backup_path(log: &Path, n: usize) -> PathBuf {
    let mut name = log.file_name().map(|name| name.to_os_string()).unwrap_or_default();
    name.push(format!(".{n}"));
    log.with_file_name(name)
}
