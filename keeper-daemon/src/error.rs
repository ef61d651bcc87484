use std::net::SocketAddr;
use std::path::PathBuf;

use keeper_core::{PossessionError, ServiceId};
use thiserror::Error;

/// Remediation shown for contention and for any network-level startup failure.
pub const FORCE_HINT: &str =
    "Looks like another instance of keeper is running. Try to kill the old process or pass the --force flag.";

/// Error surface for the daemon runtime, its services and the launch path.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Possession(#[from] PossessionError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("service '{service}' crashed: {reason}")]
    ServiceCrashed { service: ServiceId, reason: String },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("task join failure: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl DaemonError {
    /// Another live daemon already holds the possession lock.
    pub fn is_contention(&self) -> bool {
        matches!(self, DaemonError::Possession(err) if err.is_contention())
    }

    /// Whether the user should be pointed at `--force`: contention, or a
    /// bind failure that means something unmanaged squats on the endpoint.
    pub fn suggests_force(&self) -> bool {
        self.is_contention() || matches!(self, DaemonError::Bind { .. })
    }
}

/// Connection-local failures. Never escalated beyond the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("service '{0}' is not accepting channels")]
    ServiceUnavailable(ServiceId),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("handshake timed out")]
    HandshakeTimeout,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

/// Failures to even start a background child. A child that starts but never
/// reports readiness is an outcome, not an error.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("background child has no stdout to read readiness from")]
    NoStdout,

    #[error("failed to build launch runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
