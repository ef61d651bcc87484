//! Owner liveness and termination backed by the daemon socket.
//!
//! An owner is live only if something answers on the recorded port *and*
//! accepts the recorded key. A reused pid or an unrelated listener on the
//! port never counts.
//!
//! Termination has one fallback for a daemon whose record went out of sync
//! with its key: when the recorded port is still taken and the recorded pid
//! runs this same program, that pid is signalled without a key check.

use std::error::Error as StdError;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use keeper_core::{OwnerKiller, OwnerProbe, PossessionRecord};

use crate::client;
use crate::paths::{endpoint, PROBE_TIMEOUT};

/// How long a stopped owner gets to stop answering before it is signalled.
pub const STOP_WAIT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct SocketProbe {
    timeout: Duration,
}

impl SocketProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SocketProbe {
    fn default() -> Self {
        Self::new(PROBE_TIMEOUT)
    }
}

impl OwnerProbe for SocketProbe {
    fn is_live(&self, record: &PossessionRecord) -> bool {
        client::ping(record.port, &record.key, self.timeout)
    }
}

/// Asks the recorded owner to shut down over its socket, then falls back to
/// SIGTERM on its pid while it still answers with the recorded key.
#[derive(Debug, Clone, Copy)]
pub struct SocketKiller {
    probe: SocketProbe,
    wait: Duration,
}

impl SocketKiller {
    pub fn new(probe: SocketProbe, wait: Duration) -> Self {
        Self { probe, wait }
    }

    fn wait_until_gone(&self, record: &PossessionRecord) -> bool {
        self.wait_until(|| !self.probe.is_live(record))
    }

    fn wait_until(&self, done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + self.wait;
        loop {
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Default for SocketKiller {
    fn default() -> Self {
        Self::new(SocketProbe::default(), STOP_WAIT)
    }
}

impl OwnerKiller for SocketKiller {
    fn terminate(&self, record: &PossessionRecord) -> Result<(), Box<dyn StdError + Send + Sync>> {
        if !self.probe.is_live(record) {
            if !(port_in_use(record.port, self.probe.timeout) && same_program(record.owner.pid)) {
                tracing::debug!(owner = %record.owner, "recorded owner already gone");
                return Ok(());
            }
            tracing::warn!(
                owner = %record.owner,
                port = record.port,
                "recorded owner rejects its key but still holds the port",
            );
            signal_owner(record)?;
            return if self.wait_until(|| !port_in_use(record.port, self.probe.timeout)) {
                Ok(())
            } else {
                Err(format!("port {} still taken after SIGTERM to {}", record.port, record.owner).into())
            };
        }

        match client::request_stop(record.port, record.key.as_str(), self.probe.timeout) {
            Ok(_) => tracing::info!(owner = %record.owner, "asked previous daemon to stop"),
            Err(err) => tracing::warn!(owner = %record.owner, error = %err, "stop request failed"),
        }
        if self.wait_until_gone(record) {
            return Ok(());
        }

        signal_owner(record)?;
        if self.wait_until_gone(record) {
            Ok(())
        } else {
            Err(format!("daemon {} still answering after SIGTERM", record.owner).into())
        }
    }
}

fn port_in_use(port: u16, timeout: Duration) -> bool {
    TcpStream::connect_timeout(&endpoint(port), timeout).is_ok()
}

/// Whether `pid` is another process running the same executable as this
/// one, going by the kernel's command name.
#[cfg(target_os = "linux")]
fn same_program(pid: u32) -> bool {
    if pid == std::process::id() {
        return false;
    }
    let comm = |who: &str| {
        std::fs::read_to_string(format!("/proc/{who}/comm"))
            .ok()
            .map(|name| name.trim_end().to_string())
    };
    match (comm(&pid.to_string()), comm("self")) {
        (Some(theirs), Some(ours)) => !theirs.is_empty() && theirs == ours,
        _ => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn same_program(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn signal_owner(record: &PossessionRecord) -> Result<(), Box<dyn StdError + Send + Sync>> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if record.owner.pid == std::process::id() {
        return Err("refusing to signal the current process".into());
    }
    let pid = i32::try_from(record.owner.pid)?;
    tracing::warn!(owner = %record.owner, "sending SIGTERM to previous daemon");
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(not(unix))]
fn signal_owner(record: &PossessionRecord) -> Result<(), Box<dyn StdError + Send + Sync>> {
    Err(format!("cannot signal {} on this platform", record.owner).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_core::OwnerIdentity;
    use std::net::TcpListener;

    fn record_on_closed_port() -> PossessionRecord {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        PossessionRecord::new(
            OwnerIdentity {
                user: "dev".to_string(),
                pid: u32::MAX,
            },
            port,
        )
    }

    #[test]
    fn unreachable_owner_is_not_live() {
        let probe = SocketProbe::new(Duration::from_millis(100));
        assert!(!probe.is_live(&record_on_closed_port()));
    }

    #[test]
    fn own_pid_is_never_the_same_program() {
        assert!(!same_program(std::process::id()));
        assert!(!same_program(u32::MAX));
    }

    #[test]
    fn squatted_port_with_foreign_pid_is_left_alone() {
        let squatter = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = squatter.local_addr().expect("addr").port();
        assert!(port_in_use(port, Duration::from_millis(200)));

        let record = PossessionRecord::new(
            OwnerIdentity {
                user: "dev".to_string(),
                pid: u32::MAX,
            },
            port,
        );
        let killer = SocketKiller::new(SocketProbe::new(Duration::from_millis(200)), Duration::ZERO);
        killer.terminate(&record).expect("nothing to signal");
    }

    #[test]
    fn terminating_a_gone_owner_is_a_noop() {
        let killer = SocketKiller::new(SocketProbe::new(Duration::from_millis(100)), Duration::ZERO);
        killer
            .terminate(&record_on_closed_port())
            .expect("nothing to kill");
    }
}
