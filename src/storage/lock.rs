//! Advisory write lock for a result artifact.
//!
//! The lock is a sentinel file next to the artifact, created with create-new
//! semantics so exactly one holder wins across threads and processes. The
//! sentinel is removed when the guard drops, which covers early returns,
//! panics and aborted tasks alike.
//!
//! A sentinel left behind by a dead or long-stalled holder is taken over
//! under a second create-new marker (`<artifact>.lock.takeover`). Only the
//! marker's holder may delete someone else's sentinel, and it re-reads the
//! sentinel first, so two waiters can never both clear their way in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, warn};

use crate::core::config::LockPolicy;
use crate::core::errors::{GridError, Result};

/// Contents of a lock sentinel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSentinel {
    pub pid: u32,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    /// Random per acquisition; tells a holder's own sentinel from a successor's
    pub token: u64,
}

impl LockSentinel {
    fn current() -> Self {
        let thread = std::thread::current();
        Self {
            pid: std::process::id(),
            holder: thread.name().unwrap_or("unnamed").to_string(),
            acquired_at: Utc::now(),
            token: fastrand::u64(..),
        }
    }

    fn is_holder_alive(&self) -> bool {
        is_pid_alive(self.pid)
    }

    fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or_default()
    }
}

/// RAII guard for the artifact's write lock
#[derive(Debug)]
pub struct WriteLock {
    path: PathBuf,
    sentinel: LockSentinel,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let current = match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice::<LockSentinel>(&bytes).ok(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(lock = %self.path.display(), "Write lock sentinel vanished before release");
                return;
            }
            Err(e) => {
                error!(lock = %self.path.display(), error = %e, "Failed to read write lock on release");
                return;
            }
        };
        if current.as_ref() != Some(&self.sentinel) {
            warn!(
                lock = %self.path.display(),
                successor_pid = current.map(|s| s.pid),
                "Write lock was taken over; leaving the current sentinel in place"
            );
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "Released write lock"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(lock = %self.path.display(), "Write lock sentinel vanished before release")
            }
            Err(e) => error!(lock = %self.path.display(), error = %e, "Failed to release write lock"),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("artifact"));
    name.push(suffix);
    path.with_file_name(name)
}

/// Sentinel path for an artifact: `<artifact>.lock` next to it
pub fn lock_path_for(artifact: &Path) -> PathBuf {
    with_suffix(artifact, ".lock")
}

fn takeover_path_for(lock_path: &Path) -> PathBuf {
    with_suffix(lock_path, ".takeover")
}

/// Block until the artifact's write lock is held or the policy gives up.
pub fn acquire(artifact: &Path, policy: &LockPolicy) -> Result<WriteLock> {
    let lock_path = lock_path_for(artifact);
    let started = Instant::now();
    let mut retries: u32 = 0;

    loop {
        if let Some(lock) = try_acquire(&lock_path)? {
            return Ok(lock);
        }

        if recover_stale(&lock_path, policy.stale_after)? {
            continue;
        }

        if policy.is_exhausted(retries) {
            let waited_ms = started.elapsed().as_millis() as u64;
            warn!(
                artifact = %artifact.display(),
                attempts = retries + 1,
                waited_ms,
                "Giving up on write lock"
            );
            return Err(GridError::StoreLockTimeout {
                path: artifact.to_path_buf(),
                attempts: retries + 1,
                waited_ms,
            });
        }

        let delay = policy.backoff_delay(retries);
        let jitter = fastrand::u64(0..=delay.as_nanos() as u64 / 2);
        std::thread::sleep(delay + Duration::from_nanos(jitter));
        retries += 1;
    }
}

fn try_acquire(lock_path: &Path) -> Result<Option<WriteLock>> {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => {
            return Err(GridError::io(
                format!("create lock sentinel {}", lock_path.display()),
                e,
            ))
        }
    };

    let sentinel = LockSentinel::current();
    let written = serde_json::to_vec(&sentinel)
        .map_err(GridError::from)
        .and_then(|payload| {
            file.write_all(&payload)
                .and_then(|_| file.sync_all())
                .map_err(|e| GridError::io("write lock sentinel", e))
        });
    if let Err(err) = written {
        if let Err(e) = fs::remove_file(lock_path) {
            error!(lock = %lock_path.display(), error = %e, "Failed to remove half-written lock sentinel");
        }
        return Err(err);
    }

    debug!(lock = %lock_path.display(), pid = sentinel.pid, "Acquired write lock");
    Ok(Some(WriteLock {
        path: lock_path.to_path_buf(),
        sentinel,
    }))
}

/// Remove the sentinel if its holder is gone or it has outlived `stale_after`.
///
/// Returns true when a sentinel was removed.
fn recover_stale(lock_path: &Path, stale_after: Duration) -> Result<bool> {
    if staleness(lock_path, stale_after)?.is_none() {
        return Ok(false);
    }

    let takeover_path = takeover_path_for(lock_path);
    let Some(_takeover) = try_acquire(&takeover_path)? else {
        // Another waiter is mid-takeover, unless it died holding the marker.
        if let Some(reason) = staleness(&takeover_path, stale_after)? {
            warn!(marker = %takeover_path.display(), %reason, "Removing abandoned takeover marker");
            remove_if_present(&takeover_path)?;
        }
        return Ok(false);
    };

    // The sentinel seen above may already have been replaced by a live one.
    let Some(reason) = staleness(lock_path, stale_after)? else {
        return Ok(false);
    };
    warn!(lock = %lock_path.display(), %reason, "Recovering stale write lock");
    remove_if_present(lock_path)?;
    Ok(true)
}

/// Why the sentinel at `path` may be taken over, if it may
fn staleness(path: &Path, stale_after: Duration) -> Result<Option<String>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GridError::io("read lock sentinel", e)),
    };

    let reason = match serde_json::from_slice::<LockSentinel>(&bytes) {
        Ok(sentinel) if !sentinel.is_holder_alive() => {
            Some(format!("holder process {} is gone", sentinel.pid))
        }
        Ok(sentinel) if sentinel.age() > stale_after => Some(format!(
            "held by process {} for {}ms",
            sentinel.pid,
            sentinel.age().as_millis()
        )),
        Ok(_) => None,
        // Unreadable only past stale_after; a holder may be between create and write
        Err(_) => {
            let age = fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or_default();
            (age > stale_after).then(|| format!("unreadable for {}ms", age.as_millis()))
        }
    };
    Ok(reason)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GridError::io(
            format!("remove stale sentinel {}", path.display()),
            e,
        )),
    }
}

#[cfg(target_os = "linux")]
fn is_pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

// Without a cheap liveness check, rely on stale_after alone.
#[cfg(not(target_os = "linux"))]
fn is_pid_alive(_pid: u32) -> bool {
    true
}
