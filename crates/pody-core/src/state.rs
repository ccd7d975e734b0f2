//! Persistent state files.
//!
//! Every state document is plain JSON in the data directory. Writes go to
//! a temporary sibling first and are renamed into place, so a crash never
//! leaves a half-written file behind.
//!
//! Several processes may share one data directory. Each document has an
//! advisory lock file next to it (`ledger.json` is guarded by
//! `ledger.lock`); read-modify-write cycles hold it exclusively and plain
//! reads hold it shared.

use std::fs::{File, OpenOptions};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal;
use nix::unistd::Pid;
use pody_common::error::{PodyError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ledger::Pod;

/// On-disk form of the resource ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    /// Mutation counter at the time of the save.
    pub version: u64,
    /// Registered pods.
    pub pods: Vec<Pod>,
    /// Reservations whose container is still being created.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PendingClaim>,
}

/// Resources held for a pod that is not registered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingClaim {
    /// Full pod name.
    pub name: String,
    /// Owning username.
    pub owner: String,
    /// Allocated GPU devices.
    pub gpu_ids: Vec<u32>,
    /// Allocated host ports.
    pub host_ports: Vec<u16>,
    /// PID of the process creating the pod.
    pub holder: u32,
}

impl PendingClaim {
    /// Whether the creating process still exists. A claim left behind by a
    /// crashed process is stale and its resources are free again.
    #[must_use]
    pub fn is_live(&self) -> bool {
        process_alive(self.holder)
    }
}

/// Whether `pid` names a running process.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // EPERM still proves the process exists.
    !matches!(signal::kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

/// Held advisory lock on a state document; released on drop.
pub struct StateLock {
    _file: Flock<File>,
}

impl std::fmt::Debug for StateLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLock").finish_non_exhaustive()
    }
}

/// Blocks until the lock guarding `path` is held, exclusively or shared.
///
/// # Errors
///
/// Returns an error if the lock file cannot be created or locked.
pub fn lock(path: &Path, exclusive: bool) -> Result<StateLock> {
    let lock_path = path.with_extension("lock");
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PodyError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| PodyError::Io {
            path: lock_path.clone(),
            source: e,
        })?;
    let arg = if exclusive {
        FlockArg::LockExclusive
    } else {
        FlockArg::LockShared
    };
    let file = Flock::lock(file, arg).map_err(|(_, errno)| PodyError::Io {
        path: lock_path,
        source: errno.into(),
    })?;
    Ok(StateLock { _file: file })
}

/// Reads a JSON document, returning `T::default()` if the file does not
/// exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "state file absent, starting empty");
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| PodyError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Writes a JSON document atomically.
///
/// # Errors
///
/// Returns an error if the directory, temporary file, or rename fails.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PodyError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, json).map_err(|e| PodyError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        PodyError::Io {
            path: path.to_path_buf(),
            source: e,
        }
    })
}

/// Loads the ledger state.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_state(path: &Path) -> Result<LedgerState> {
    tracing::debug!(path = %path.display(), "loading ledger state");
    load_json(path)
}

/// Persists the ledger state atomically.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_state(path: &Path, state: &LedgerState) -> Result<()> {
    tracing::debug!(path = %path.display(), version = state.version, "saving ledger state");
    save_json(path, state)
}
