//! Pid-file locks that coordinate independent processes working on the same
//! directory.
//!
//! An exclusive lock is a `<name>.pid` file created with `O_EXCL` that holds
//! the owner's pid. Shared locks are `ro.<pid>.pid` files, one per reader
//! process. A lock whose owner is no longer alive is stale and is taken over.
//! Locks are released when the [`LockGuard`] is dropped.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::backoff::poll_until_blocking;

const SHARED_PREFIX: &str = "ro.";
const PID_SUFFIX: &str = ".pid";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock file {path} is held by process {pid}")]
    Busy { path: Utf8PathBuf, pid: i32 },
    #[error("lock file {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Utf8Path, source: io::Error) -> Self {
        LockError::Io {
            path: path.to_owned(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// Held lock. Dropping it removes the lock file, unless the lock was
/// already held by this process when it was taken.
#[derive(Debug)]
#[must_use]
pub struct LockGuard {
    path: Utf8PathBuf,
    owned: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove lock file {}: {e}", self.path);
            }
        }
    }
}

/// Whether a process with the given pid exists.
pub fn process_is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // exists, but belongs to somebody else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Reads the pid stored in a lock file. `Ok(None)` if the file is gone.
/// An unparsable file is reported as pid 0, which is never alive.
fn read_pid(path: &Utf8Path) -> Result<Option<i32>, LockError> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().parse().unwrap_or(0))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LockError::io(path, e)),
    }
}

fn create_pid_file(path: &Utf8Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}

fn remove_stale(path: &Utf8Path, pid: i32) -> Result<(), LockError> {
    warn!("lock file {path} of process {pid} has expired, taking it over");
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LockError::io(path, e)),
    }
}

/// Pid of a live process other than us that holds `path`, cleaning it up if
/// the holder is dead.
fn live_holder(path: &Utf8Path) -> Result<Option<i32>, LockError> {
    let me = std::process::id() as i32;
    match read_pid(path)? {
        None => Ok(None),
        Some(pid) if pid == me => Ok(None),
        Some(pid) if process_is_alive(pid) => Ok(Some(pid)),
        Some(pid) => {
            remove_stale(path, pid)?;
            Ok(None)
        }
    }
}

/// Live shared holders of `dir` other than this process.
fn live_shared_holders(dir: &Utf8Path) -> Result<Vec<(Utf8PathBuf, i32)>, LockError> {
    let me = std::process::id() as i32;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LockError::io(dir, e)),
    };
    let mut holders = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LockError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(pid) = name
            .strip_prefix(SHARED_PREFIX)
            .and_then(|s| s.strip_suffix(PID_SUFFIX))
            .and_then(|s| s.parse::<i32>().ok())
        else {
            continue;
        };
        if pid == me {
            continue;
        }
        let path = dir.join(name);
        if process_is_alive(pid) {
            holders.push((path, pid));
        } else {
            remove_stale(&path, pid)?;
        }
    }
    Ok(holders)
}

fn try_exclusive(dir: &Utf8Path, name: &str) -> Result<Option<LockGuard>, LockError> {
    let path = dir.join(name);
    let guard = loop {
        match create_pid_file(&path) {
            Ok(()) => {
                break LockGuard {
                    path: path.clone(),
                    owned: true,
                };
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match read_pid(&path)? {
                    // vanished in between, try again
                    None => continue,
                    Some(pid) if pid == std::process::id() as i32 => {
                        break LockGuard {
                            path: path.clone(),
                            owned: false,
                        };
                    }
                    Some(pid) if process_is_alive(pid) => return Ok(None),
                    Some(pid) => remove_stale(&path, pid)?,
                }
            }
            Err(e) => return Err(LockError::io(&path, e)),
        }
    };
    // readers that were in before us win; back off and retry later
    if !live_shared_holders(dir)?.is_empty() {
        drop(guard);
        return Ok(None);
    }
    Ok(Some(guard))
}

fn try_shared(dir: &Utf8Path, exclusive_name: &str) -> Result<Option<LockGuard>, LockError> {
    let exclusive = dir.join(exclusive_name);
    if live_holder(&exclusive)?.is_some() {
        return Ok(None);
    }
    let path = dir.join(format!(
        "{SHARED_PREFIX}{}{PID_SUFFIX}",
        std::process::id()
    ));
    let guard = match create_pid_file(&path) {
        Ok(()) => LockGuard { path, owned: true },
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => LockGuard { path, owned: false },
        Err(e) => return Err(LockError::io(&path, e)),
    };
    // a writer may have slipped in between the check and our file
    if live_holder(&exclusive)?.is_some() {
        drop(guard);
        return Ok(None);
    }
    Ok(Some(guard))
}

/// Takes a lock on `dir`, waiting up to `timeout` for live holders to go
/// away. `exclusive_name` is the name of the exclusive lock file, e.g.
/// `backup.pid`.
pub fn lock_dir(
    dir: &Utf8Path,
    exclusive_name: &str,
    mode: LockMode,
    timeout: Duration,
) -> Result<LockGuard, LockError> {
    let guard = poll_until_blocking(timeout, || match mode {
        LockMode::Exclusive => try_exclusive(dir, exclusive_name),
        LockMode::Shared => try_shared(dir, exclusive_name),
    })?;
    if let Some(guard) = guard {
        debug!("locked {} ({mode:?})", guard.path);
        return Ok(guard);
    }
    // report who is in the way
    let exclusive = dir.join(exclusive_name);
    if let Some(pid) = live_holder(&exclusive)? {
        return Err(LockError::Busy {
            path: exclusive,
            pid,
        });
    }
    match live_shared_holders(dir)?.into_iter().next() {
        Some((path, pid)) => Err(LockError::Busy { path, pid }),
        None => Err(LockError::Busy {
            path: exclusive,
            pid: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = "backup.pid";

    /// A pid that is very unlikely to exist.
    fn dead_pid() -> i32 {
        let mut pid = 4_000_000;
        while process_is_alive(pid) {
            pid -= 1;
        }
        pid
    }

    #[test]
    fn exclusive_lock_is_released_on_drop() {
        let dir = camino_tempfile::tempdir().unwrap();
        {
            let guard = lock_dir(dir.path(), NAME, LockMode::Exclusive, Duration::ZERO).unwrap();
            assert!(guard.path().exists());
        }
        assert!(!dir.path().join(NAME).exists());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(NAME), format!("{}\n", dead_pid())).unwrap();
        std::fs::write(dir.path().join(format!("ro.{}.pid", dead_pid())), "").unwrap();

        let guard = lock_dir(dir.path(), NAME, LockMode::Exclusive, Duration::ZERO).unwrap();
        let pid: u32 = std::fs::read_to_string(guard.path())
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn live_holder_blocks_exclusive_lock() {
        let dir = camino_tempfile::tempdir().unwrap();
        // pid 1 is always alive
        std::fs::write(dir.path().join(NAME), "1\n").unwrap();

        let err = lock_dir(dir.path(), NAME, LockMode::Exclusive, Duration::ZERO).unwrap_err();
        assert!(matches!(err, LockError::Busy { pid: 1, .. }), "{err}");
        let err = lock_dir(dir.path(), NAME, LockMode::Shared, Duration::ZERO).unwrap_err();
        assert!(matches!(err, LockError::Busy { pid: 1, .. }), "{err}");
    }

    #[test]
    fn live_reader_blocks_writer() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ro.1.pid"), "1\n").unwrap();

        let err = lock_dir(dir.path(), NAME, LockMode::Exclusive, Duration::ZERO).unwrap_err();
        assert!(matches!(err, LockError::Busy { pid: 1, .. }), "{err}");
        assert!(!dir.path().join(NAME).exists());

        // readers coexist
        let _guard = lock_dir(dir.path(), NAME, LockMode::Shared, Duration::ZERO).unwrap();
    }

    #[test]
    fn relocking_in_same_process_is_reentrant() {
        let dir = camino_tempfile::tempdir().unwrap();
        let outer = lock_dir(dir.path(), NAME, LockMode::Shared, Duration::ZERO).unwrap();
        {
            let _inner = lock_dir(dir.path(), NAME, LockMode::Shared, Duration::ZERO).unwrap();
        }
        assert!(outer.path().exists());
    }
}
