//! Possession lock contention tests.
//!
//! Each `PossessionLock` handle plays the part of a separate daemon process.
//! A shared set of "live" keys stands in for the socket probe: an owner is
//! live while its key is in the set.

use std::collections::HashSet;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use keeper_core::possession::{read_key, read_record};
use keeper_core::{
    OwnerIdentity, OwnerKiller, OwnerProbe, PossessionError, PossessionLock, PossessionRecord,
};
use rstest::rstest;
use tempfile::TempDir;

#[derive(Clone, Default)]
struct LiveSet(Arc<Mutex<HashSet<String>>>);

impl LiveSet {
    fn mark_live(&self, record: &PossessionRecord) {
        self.0
            .lock()
            .expect("live set")
            .insert(record.key.as_str().to_string());
    }

    fn kill(&self, record: &PossessionRecord) {
        self.0.lock().expect("live set").remove(record.key.as_str());
    }
}

impl OwnerProbe for LiveSet {
    fn is_live(&self, record: &PossessionRecord) -> bool {
        self.0.lock().expect("live set").contains(record.key.as_str())
    }
}

struct RecordingKiller {
    live: LiveSet,
    calls: AtomicUsize,
    fail: bool,
}

impl OwnerKiller for RecordingKiller {
    fn terminate(&self, record: &PossessionRecord) -> Result<(), Box<dyn StdError + Send + Sync>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err("kill refused".into());
        }
        self.live.kill(record);
        Ok(())
    }
}

fn owner(pid: u32) -> OwnerIdentity {
    OwnerIdentity {
        user: "tester".to_string(),
        pid,
    }
}

// ---------------------------------------------------------------------------
// 1. Contention
// ---------------------------------------------------------------------------

#[test]
fn second_candidate_is_refused_while_owner_is_live() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("possession");
    let live = LiveSet::default();

    let mut first = PossessionLock::new(&path, 12122, live.clone());
    let record = first.acquire(owner(100)).expect("first acquisition");
    live.mark_live(&record);

    for pid in 101..105 {
        let mut candidate = PossessionLock::new(&path, 12122, live.clone());
        let err = candidate.acquire(owner(pid)).unwrap_err();
        assert!(err.is_contention(), "got: {err}");
        match err {
            PossessionError::AlreadyOwned { owner: holder, port } => {
                assert_eq!(holder.pid, 100);
                assert_eq!(port, 12122);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(
        read_key(&path).expect("key"),
        record.key,
        "refused attempts must not touch the owner's key"
    );
}

#[test]
fn exactly_one_candidate_wins_after_owner_dies() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("possession");
    let live = LiveSet::default();

    let mut first = PossessionLock::new(&path, 1, live.clone());
    let original = first.acquire(owner(1)).expect("first acquisition");
    live.mark_live(&original);
    live.kill(&original);

    let mut winners = Vec::new();
    for pid in 2..6 {
        let mut candidate = PossessionLock::new(&path, 1, live.clone());
        if let Ok(record) = candidate.acquire(owner(pid)) {
            live.mark_live(&record);
            winners.push(record);
        }
    }

    assert_eq!(winners.len(), 1, "one successor should take over");
    assert_eq!(winners[0].owner.pid, 2);
    assert_ne!(winners[0].key, original.key);
}

#[test]
fn concurrent_candidates_are_serialized() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("possession");
    let live = LiveSet::default();
    let wins = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8u32)
        .map(|pid| {
            let path = path.clone();
            let live = live.clone();
            let wins = wins.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let mut lock = PossessionLock::new(path, 1, live.clone());
                barrier.wait();
                match lock.acquire(owner(pid)) {
                    Ok(record) => {
                        live.mark_live(&record);
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(err) => assert!(err.is_contention(), "got: {err}"),
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("candidate thread");
    }
    assert_eq!(wins.load(Ordering::SeqCst), 1);
}

#[test]
fn released_owner_leaves_record_until_reclaimed() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("possession");
    let live = LiveSet::default();

    let mut first = PossessionLock::new(&path, 1, live.clone());
    let record = first.acquire(owner(1)).expect("acquire");
    live.mark_live(&record);
    first.release();
    live.kill(&record);

    assert!(read_record(&path).expect("read").is_some());

    let mut next = PossessionLock::new(&path, 1, live.clone());
    let reclaimed = next.acquire(owner(2)).expect("stale record reclaimed");
    assert_ne!(reclaimed.key, record.key);
}

// ---------------------------------------------------------------------------
// 2. Force clear
// ---------------------------------------------------------------------------

#[rstest]
#[case::kill_succeeds(false)]
#[case::kill_fails(true)]
fn force_clear_always_allows_a_fresh_acquisition(#[case] kill_fails: bool) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("possession");
    let live = LiveSet::default();

    let mut first = PossessionLock::new(&path, 1, live.clone());
    let previous = first.acquire(owner(1)).expect("acquire");
    live.mark_live(&previous);

    let killer = RecordingKiller {
        live: live.clone(),
        calls: AtomicUsize::new(0),
        fail: kill_fails,
    };
    let mut second = PossessionLock::new(&path, 1, live.clone());
    second.force_clear(&killer).expect("force clear");
    assert_eq!(killer.calls.load(Ordering::SeqCst), 1);
    assert!(read_record(&path).expect("read").is_none());

    let fresh = second.acquire(owner(2)).expect("acquire after force clear");
    assert_ne!(fresh.key, previous.key);
}

#[test]
fn force_clear_without_record_is_harmless() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("possession");
    let live = LiveSet::default();
    let killer = RecordingKiller {
        live: live.clone(),
        calls: AtomicUsize::new(0),
        fail: false,
    };

    let mut lock = PossessionLock::new(&path, 1, live);
    lock.force_clear(&killer).expect("force clear");
    assert_eq!(killer.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn repeated_force_restarts_never_reuse_a_key() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("possession");
    let live = LiveSet::default();
    let killer = RecordingKiller {
        live: live.clone(),
        calls: AtomicUsize::new(0),
        fail: false,
    };

    let mut seen = HashSet::new();
    for pid in 0..5 {
        let mut lock = PossessionLock::new(&path, 1, live.clone());
        lock.force_clear(&killer).expect("force clear");
        let record = lock.acquire(owner(pid)).expect("acquire");
        live.mark_live(&record);
        assert!(seen.insert(record.key.as_str().to_string()), "key reused");
    }
}
