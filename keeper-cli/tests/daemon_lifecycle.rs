use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

struct Sandbox {
    _dir: TempDir,
    lock_file: PathBuf,
    home: PathBuf,
    port: u16,
}

impl Sandbox {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        Self {
            lock_file: dir.path().join(".keeper-possession"),
            home: dir.path().join("home"),
            port,
            _dir: dir,
        }
    }

    fn keeper(&self) -> Command {
        let mut cmd = Command::cargo_bin("keeper").expect("keeper binary");
        cmd.env("KEEPER_LOCK_FILE", &self.lock_file)
            .env("KEEPER_HOME", &self.home)
            .env("KEEPER_PORT", self.port.to_string())
            .env("KEEPER_READINESS", "stdout");
        cmd
    }

    fn key(&self) -> String {
        let output = self
            .keeper()
            .args(["daemon", "--get-key"])
            .output()
            .expect("run --get-key");
        assert!(output.status.success(), "get-key failed: {output:?}");
        String::from_utf8(output.stdout).expect("utf8").trim().to_string()
    }

    fn running(&self) -> bool {
        let Ok(output) = self.keeper().arg("status").output() else {
            return false;
        };
        serde_json::from_slice::<serde_json::Value>(&output.stdout)
            .ok()
            .and_then(|value| value.get("running").and_then(|v| v.as_bool()))
            .unwrap_or(false)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = self.keeper().arg("stop").output();
        wait_until(Duration::from_secs(5), || !self.running());
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

fn lock_exists(path: &Path) -> bool {
    path.exists()
}

#[test]
fn start_refuse_then_force_takeover() {
    let sandbox = Sandbox::new();
    let running_line = format!("Running at {}", sandbox.port);

    // Fresh start.
    sandbox
        .keeper()
        .args(["daemon", "--background"])
        .assert()
        .success()
        .stdout(predicate::str::contains(running_line.clone()));
    assert!(lock_exists(&sandbox.lock_file));
    assert!(sandbox.running());
    let first_key = sandbox.key();
    assert!(!first_key.is_empty());

    // A second daemon without --force is refused and leaves the key alone.
    sandbox
        .keeper()
        .arg("daemon")
        .assert()
        .code(3)
        .stdout(predicate::str::contains(format!("Already running at {}", sandbox.port)))
        .stderr(predicate::str::contains("--force"));
    assert_eq!(sandbox.key(), first_key);

    // The same request in the background is refused the same way.
    sandbox
        .keeper()
        .args(["daemon", "-b"])
        .assert()
        .code(3)
        .stdout(predicate::str::contains("Already running at"));

    // --force tears the first daemon down and takes over with a new key.
    sandbox
        .keeper()
        .args(["daemon", "-b", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains(running_line));
    let second_key = sandbox.key();
    assert_ne!(second_key, first_key);
    assert!(sandbox.running());

    sandbox
        .keeper()
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon stop requested"));
    assert!(wait_until(Duration::from_secs(5), || !sandbox.running()));
    assert!(lock_exists(&sandbox.lock_file), "record outlives the daemon");
}

#[test]
fn get_key_without_a_daemon_fails() {
    let sandbox = Sandbox::new();
    sandbox
        .keeper()
        .args(["daemon", "--get-key"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no daemon key"));
}

#[test]
fn status_and_stop_without_a_daemon_are_harmless() {
    let sandbox = Sandbox::new();
    sandbox
        .keeper()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"running\": false"));
    sandbox
        .keeper()
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));
}
