//! Machine-wide possession lock for the daemon role.
//!
//! # Storage layout
//!
//! ```text
//! <lock path>        JSON PossessionRecord (mode 0600, replaced atomically)
//! <lock path>.lock   empty sidecar; exclusive advisory lock taken around
//!                    every check-and-commit so candidates in different
//!                    processes are serialized
//! ```
//!
//! A record on disk says nothing by itself: liveness is decided by asking an
//! [`OwnerProbe`] whether the recorded owner still answers on its port with
//! the recorded key. A record whose owner does not answer is stale and is
//! reclaimed silently.
//!
//! Handles carry all state explicitly. Several [`PossessionLock`] values
//! pointed at one path behave like several processes competing for it.

use std::error::Error as StdError;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tempfile::Builder;

use crate::error::{io_err, PossessionError};
use crate::types::{OwnerIdentity, PossessionKey, PossessionRecord};

/// Decides whether the owner named in a record is still serving.
pub trait OwnerProbe {
    fn is_live(&self, record: &PossessionRecord) -> bool;
}

/// Best-effort termination of a recorded owner, used by `--force`.
pub trait OwnerKiller {
    fn terminate(&self, record: &PossessionRecord) -> Result<(), Box<dyn StdError + Send + Sync>>;
}

impl<F> OwnerProbe for F
where
    F: Fn(&PossessionRecord) -> bool,
{
    fn is_live(&self, record: &PossessionRecord) -> bool {
        self(record)
    }
}

/// Handle on the possession record at one path.
#[derive(Debug)]
pub struct PossessionLock<P> {
    path: PathBuf,
    port: u16,
    probe: P,
    held: Option<PossessionRecord>,
    displaced: Option<PossessionRecord>,
}

impl<P: OwnerProbe> PossessionLock<P> {
    /// Handle for a daemon that will listen on `port`.
    pub fn new(path: impl Into<PathBuf>, port: u16, probe: P) -> Self {
        Self {
            path: path.into(),
            port,
            probe,
            held: None,
            displaced: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The record this handle currently owns, if any.
    pub fn held(&self) -> Option<&PossessionRecord> {
        self.held.as_ref()
    }

    /// Claims the daemon role for `owner`.
    ///
    /// Fails with [`PossessionError::AlreadyOwned`] when the existing record's
    /// owner answers the liveness probe. Every success writes a new key.
    pub fn acquire(&mut self, owner: OwnerIdentity) -> Result<PossessionRecord, PossessionError> {
        let _guard = self.critical_section()?;
        let displaced = self.ensure_unowned()?;
        let record = PossessionRecord::new(owner, self.port);
        write_record(&self.path, &record)?;
        self.displaced = displaced;
        tracing::info!(
            path = %self.path.display(),
            port = record.port,
            owner = %record.owner,
            "acquired daemon possession",
        );
        self.held = Some(record.clone());
        Ok(record)
    }

    /// Re-checks the on-disk record against the one this handle wrote.
    ///
    /// Returns `Ok(None)` when the record is still ours. When a competing
    /// candidate overwrote it while this owner was not yet reachable, the
    /// role is re-acquired with a fresh key and the new record is returned.
    pub fn reconcile(&mut self) -> Result<Option<PossessionRecord>, PossessionError> {
        let Some(held) = self.held.clone() else {
            return Ok(None);
        };
        let _guard = self.critical_section()?;
        match read_record(&self.path) {
            Ok(Some(current)) if current.key == held.key => return Ok(None),
            Ok(Some(current)) => {
                tracing::warn!(
                    owner = %current.owner,
                    "possession record was replaced during startup; reclaiming",
                );
                if current.owner != held.owner && self.probe.is_live(&current) {
                    self.held = None;
                    return Err(PossessionError::AlreadyOwned {
                        owner: current.owner,
                        port: current.port,
                    });
                }
            }
            Ok(None) => {
                tracing::warn!("possession record vanished during startup; rewriting");
            }
            Err(err) => {
                tracing::warn!(error = %err, "possession record unreadable; rewriting");
            }
        }
        let record = PossessionRecord::new(held.owner, self.port);
        write_record(&self.path, &record)?;
        self.held = Some(record.clone());
        self.displaced = None;
        Ok(Some(record))
    }

    /// Undoes an acquisition whose owner never went live.
    ///
    /// The record this handle wrote is replaced by the stale record it
    /// displaced, or removed when there was none, so a failed start leaves
    /// the lock file as it found it. A record someone else wrote since is
    /// left alone.
    pub fn abandon(&mut self) -> Result<(), PossessionError> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        let displaced = self.displaced.take();
        let _guard = self.critical_section()?;
        match read_record(&self.path) {
            Ok(Some(current)) if current.key == held.key => {}
            _ => {
                tracing::debug!(
                    path = %self.path.display(),
                    "possession record changed since acquisition; leaving it",
                );
                return Ok(());
            }
        }
        match displaced {
            Some(previous) => {
                write_record(&self.path, &previous)?;
                tracing::info!(owner = %previous.owner, "restored previous possession record");
            }
            None => {
                remove_record(&self.path)?;
                tracing::info!(path = %self.path.display(), "removed unused possession record");
            }
        }
        Ok(())
    }

    /// Gives up this handle's ownership. The record stays on disk; a record
    /// without a live owner is reclaimed by the next acquisition.
    pub fn release(&mut self) {
        self.displaced = None;
        if let Some(record) = self.held.take() {
            tracing::info!(
                path = %self.path.display(),
                owner = %record.owner,
                "released daemon possession",
            );
        }
    }

    /// Terminates whatever process the record names, then deletes the record.
    ///
    /// Termination failures are logged and swallowed so a failed kill never
    /// blocks the acquisition that follows. Only failing to delete an
    /// existing record is reported.
    pub fn force_clear<K: OwnerKiller + ?Sized>(&mut self, killer: &K) -> Result<(), PossessionError> {
        match read_record(&self.path) {
            Ok(Some(record)) => {
                if let Err(err) = killer.terminate(&record) {
                    tracing::warn!(
                        owner = %record.owner,
                        error = %err,
                        "failed to terminate previous daemon; continuing",
                    );
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "ignoring unreadable possession record"),
        }

        self.held = None;
        self.displaced = None;
        let _guard = self.critical_section()?;
        if remove_record(&self.path)? {
            tracing::info!(path = %self.path.display(), "cleared possession record");
        }
        Ok(())
    }

    /// Returns the stale record about to be replaced, if any.
    fn ensure_unowned(&self) -> Result<Option<PossessionRecord>, PossessionError> {
        let existing = match read_record(&self.path) {
            Ok(existing) => existing,
            Err(err @ PossessionError::Corrupt { .. }) => {
                tracing::warn!(error = %err, "reclaiming unreadable possession record");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let Some(record) = existing else {
            return Ok(None);
        };
        if self.probe.is_live(&record) {
            tracing::info!(
                owner = %record.owner,
                port = record.port,
                "refusing to acquire: existing daemon alive",
            );
            return Err(PossessionError::AlreadyOwned {
                owner: record.owner,
                port: record.port,
            });
        }
        tracing::warn!(
            owner = %record.owner,
            port = record.port,
            "previous daemon not reachable; reclaiming stale record",
        );
        Ok(Some(record))
    }

    fn critical_section(&self) -> Result<SidecarGuard, PossessionError> {
        SidecarGuard::lock(&sidecar_path(&self.path))
    }
}

/// Reads the key of whichever daemon currently holds the record at `path`.
pub fn read_key(path: &Path) -> Result<PossessionKey, PossessionError> {
    read_record(path)?
        .map(|record| record.key)
        .ok_or_else(|| PossessionError::NoRecord {
            path: path.to_path_buf(),
        })
}

/// Loads the record at `path`; `Ok(None)` when no record exists.
pub fn read_record(path: &Path) -> Result<Option<PossessionRecord>, PossessionError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path, err)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| PossessionError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Exclusive advisory lock on the sidecar file; released on drop.
struct SidecarGuard {
    file: File,
}

impl SidecarGuard {
    fn lock(path: &Path) -> Result<Self, PossessionError> {
        ensure_parent(path)?;
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path).map_err(|e| io_err(path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| io_err(path, e))?;
        Ok(Self { file })
    }
}

impl Drop for SidecarGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn ensure_parent(path: &Path) -> Result<(), PossessionError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))
        }
        _ => Ok(()),
    }
}

/// Deletes the record; `Ok(false)` when there was none.
fn remove_record(path: &Path) -> Result<bool, PossessionError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_err(path, err)),
    }
}

/// Replaces the record atomically: readers see the old or the new record,
/// never a partial write.
fn write_record(path: &Path, record: &PossessionRecord) -> Result<(), PossessionError> {
    ensure_parent(path)?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let payload = serde_json::to_vec_pretty(record)?;

    let mut builder = Builder::new();
    builder.prefix(".keeper-possession");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(fs::Permissions::from_mode(0o600));
    }
    let mut file = builder
        .tempfile_in(&directory)
        .map_err(|e| io_err(&directory, e))?;
    file.write_all(&payload).map_err(|e| io_err(path, e))?;
    file.write_all(b"\n").map_err(|e| io_err(path, e))?;
    file.as_file().sync_all().map_err(|e| io_err(path, e))?;
    file.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(())
}
