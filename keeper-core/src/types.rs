//! Domain types shared by the daemon, its clients and the CLI.
//!
//! Everything here is plain data: no I/O, no global state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// The closed set of services a daemon can host.
///
/// Clients address a service by its wire name when opening a logical
/// channel; names outside this set are rejected at the protocol boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceId {
    /// Protocol-facing editor assistance service. Always started.
    CodeAssist,
    /// Auxiliary tray integration. Skipped in minimal mode.
    Tray,
}

/// Returned by [`ServiceId::parse`] for names outside the service table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown service '{0}'")]
pub struct UnknownServiceName(pub String);

impl ServiceId {
    /// Every service, in start order.
    pub const ALL: [ServiceId; 2] = [ServiceId::CodeAssist, ServiceId::Tray];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceId::CodeAssist => "code-assist",
            ServiceId::Tray => "tray",
        }
    }

    /// Whether the service belongs to the minimal set started with `--minimal`.
    pub fn is_core(self) -> bool {
        matches!(self, ServiceId::CodeAssist)
    }

    pub fn parse(name: &str) -> Result<Self, UnknownServiceName> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == name)
            .ok_or_else(|| UnknownServiceName(name.to_owned()))
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceId {
    type Err = UnknownServiceName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Possession key
// ---------------------------------------------------------------------------

/// Shared secret a client must replay to be treated as a local peer.
///
/// Rendered as 32 lowercase hex characters. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PossessionKey(String);

impl PossessionKey {
    /// Fresh key backed by a random v4 UUID (122 bits from the OS RNG).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares against a presented key without short-circuiting on the
    /// first differing byte.
    pub fn matches(&self, presented: &str) -> bool {
        let expected = self.0.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for PossessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PossessionKey(<redacted>)")
    }
}

impl fmt::Display for PossessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PossessionKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for PossessionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Possession record
// ---------------------------------------------------------------------------

/// Who holds (or last held) the daemon role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerIdentity {
    pub user: String,
    pub pid: u32,
}

impl OwnerIdentity {
    /// Identity of the calling process.
    pub fn current() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            user,
            pid: std::process::id(),
        }
    }
}

impl fmt::Display for OwnerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pid {})", self.user, self.pid)
    }
}

/// Persisted lock contents.
///
/// Serialized as JSON; unknown fields are ignored so newer daemons can add
/// fields without breaking older readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PossessionRecord {
    pub owner: OwnerIdentity,
    pub key: PossessionKey,
    /// Port the owner listens on; probed to decide liveness.
    pub port: u16,
    pub acquired_at: DateTime<Utc>,
}

impl PossessionRecord {
    pub fn new(owner: OwnerIdentity, port: u16) -> Self {
        Self {
            owner,
            key: PossessionKey::generate(),
            port,
            acquired_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run configuration
// ---------------------------------------------------------------------------

/// Flags that alter how the daemon runs, resolved once from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonRunConfig {
    pub debug: bool,
    /// `false` in minimal mode: only core services are started.
    pub run_child_processes: bool,
}

impl DaemonRunConfig {
    pub fn new(debug: bool, minimal: bool) -> Self {
        Self {
            debug,
            run_child_processes: !minimal,
        }
    }

    /// Whether `service` should be started under this configuration.
    pub fn wants(&self, service: ServiceId) -> bool {
        self.run_child_processes || service.is_core()
    }
}

impl Default for DaemonRunConfig {
    fn default() -> Self {
        Self::new(false, false)
    }
}
