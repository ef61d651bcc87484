//! Error types for keeper-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::OwnerIdentity;

/// All errors that can arise from possession lock operations.
#[derive(Debug, Error)]
pub enum PossessionError {
    /// Another live daemon holds the lock. Recoverable: the caller may wait,
    /// connect to the existing instance, or force a restart.
    #[error("daemon already owned by {owner} on port {port}")]
    AlreadyOwned { owner: OwnerIdentity, port: u16 },

    /// Filesystem failure on the lock path (permission denied, missing
    /// volume, ...). Fatal to daemon startup.
    #[error("possession lock I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serializing a fresh record failed.
    #[error("failed to encode possession record: {0}")]
    Encode(#[from] serde_json::Error),

    /// No record exists at the lock path (nothing to read a key from).
    #[error("no possession record at {path}; is the daemon running?")]
    NoRecord { path: PathBuf },

    /// The record exists but cannot be parsed.
    #[error("possession record at {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PossessionError {
    /// `true` for the contention case the CLI turns into `--force` guidance.
    pub fn is_contention(&self) -> bool {
        matches!(self, PossessionError::AlreadyOwned { .. })
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> PossessionError {
    PossessionError::Io {
        path: path.into(),
        source,
    }
}
