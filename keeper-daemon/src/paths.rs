//! Well-known locations and endpoint constants.
//!
//! Every resolver has an `_from`/`_in` form taking explicit inputs so tests
//! never touch the real user's lock file or home directory.

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fixed local port negotiated between daemon and clients.
pub const DEFAULT_PORT: u16 = 12122;

pub const PORT_ENV: &str = "KEEPER_PORT";
pub const LOCK_FILE_ENV: &str = "KEEPER_LOCK_FILE";
pub const HOME_ENV: &str = "KEEPER_HOME";
pub const READINESS_ENV: &str = "KEEPER_READINESS";

pub const LOCK_FILE_NAME: &str = ".keeper-possession";
pub const DAEMON_LOG: &str = "daemon.log";

/// How long a liveness probe may take before the owner counts as gone.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Loopback address the daemon binds for `port`.
pub fn endpoint(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Port from `KEEPER_PORT`, falling back to [`DEFAULT_PORT`].
pub fn port() -> u16 {
    port_from(env::var(PORT_ENV).ok().as_deref())
}

pub fn port_from(value: Option<&str>) -> u16 {
    value
        .and_then(|raw| raw.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT)
}

/// Lock file from `KEEPER_LOCK_FILE`, else the platform default.
pub fn lock_path() -> PathBuf {
    env::var_os(LOCK_FILE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(default_lock_path)
}

#[cfg(not(windows))]
pub fn default_lock_path() -> PathBuf {
    lock_path_in(&env::temp_dir())
}

#[cfg(windows)]
pub fn default_lock_path() -> PathBuf {
    let base = env::var_os("PROGRAMDATA")
        .map(|dir| PathBuf::from(dir).join("keeper"))
        .unwrap_or_else(env::temp_dir);
    lock_path_in(&base)
}

pub fn lock_path_in(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE_NAME)
}

/// `<home>/.keeper`, or `KEEPER_HOME` when set.
pub fn data_dir() -> Option<PathBuf> {
    env::var_os(HOME_ENV)
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| data_dir_in(&home)))
}

pub fn data_dir_in(home: &Path) -> PathBuf {
    home.join(".keeper")
}

pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

pub fn daemon_log_path(data_dir: &Path) -> PathBuf {
    logs_dir(data_dir).join(DAEMON_LOG)
}
