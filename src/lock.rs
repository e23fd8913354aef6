//! Inter-process cache-entry locks.
//!
//! Locks are platform-native advisory file locks (POSIX `flock`, Windows
//! `LockFileEx`) held for the lifetime of an [`EntryLock`]. The lock file's
//! contents are a JSON [`LockInfo`] sidecar written by the current holder;
//! it is purely diagnostic (contention reporting), never consulted for
//! mutual exclusion, and a stale one is simply overwritten by the next
//! holder. Lock files are never deleted, which keeps acquisition free of
//! unlink races.

use crate::error::LockError;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::process;
use std::time::Duration;

/// Diagnostic information written into a held lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the holder.
    pub pid: u32,
    /// RFC3339 UTC timestamp of acquisition.
    pub created_at: DateTime<Utc>,
    /// The cache key the lock protects.
    pub key: String,
    /// Engine version of the holder.
    pub engine_version: String,
}

/// An exclusive advisory lock on one cache entry. Released on drop.
pub struct EntryLock {
    path: Utf8PathBuf,
    file: File,
    info: LockInfo,
}

impl EntryLock {
    /// Acquire the lock, blocking until the current holder (if any)
    /// releases it. Transient open/write failures are retried up to
    /// `retries` times with linear backoff before becoming fatal.
    pub fn acquire(
        path: &Utf8Path,
        key: &str,
        retries: u32,
        backoff: Duration,
    ) -> Result<Self, LockError> {
        let mut attempt = 0;
        loop {
            match Self::acquire_once(path, key, true) {
                Ok(Some(lock)) => return Ok(lock),
                Ok(None) => unreachable!("blocking acquire cannot report contention"),
                Err(e) if attempt < retries => {
                    tracing::debug!(path = %path, attempt, "lock acquisition retry: {e}");
                    std::thread::sleep(backoff.saturating_mul(attempt + 1));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to acquire the lock without blocking. Returns `Ok(None)` when
    /// another process holds it.
    pub fn try_acquire(path: &Utf8Path, key: &str) -> Result<Option<Self>, LockError> {
        Self::acquire_once(path, key, false)
    }

    fn acquire_once(path: &Utf8Path, key: &str, block: bool) -> Result<Option<Self>, LockError> {
        if let Some(parent) = path.parent() {
            crate::paths::ensure_dir_all(parent).map_err(|e| LockError::Io {
                path: path.to_string(),
                source: e,
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.as_std_path())
            .map_err(|e| LockError::Io {
                path: path.to_string(),
                source: e,
            })?;

        if !sys::lock_exclusive(&file, block).map_err(|e| LockError::Io {
            path: path.to_string(),
            source: e,
        })? {
            return Ok(None);
        }

        let info = LockInfo {
            pid: process::id(),
            created_at: Utc::now(),
            key: key.to_string(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        // The sidecar content is best-effort; holding the flock is what
        // matters. Failure to write it must not leak the lock.
        if let Err(e) = Self::write_info(&mut file, &info) {
            sys::unlock(&file);
            return Err(LockError::Io {
                path: path.to_string(),
                source: e,
            });
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
            info,
        }))
    }

    fn write_info(file: &mut File, info: &LockInfo) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(info)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(json.as_bytes())?;
        file.flush()
    }

    /// Read the holder information recorded in a lock file, if any.
    ///
    /// The result is advisory: the recorded holder may have exited without
    /// truncating the file.
    pub fn holder(path: &Utf8Path) -> Result<Option<LockInfo>, LockError> {
        let mut file = match File::open(path.as_std_path()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LockError::Io {
                    path: path.to_string(),
                    source: e,
                });
            }
        };
        let mut content = String::new();
        file.read_to_string(&mut content).map_err(|e| LockError::Io {
            path: path.to_string(),
            source: e,
        })?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_str(&content).ok())
    }

    /// Contention error naming the recorded holder of `path`.
    #[must_use]
    pub fn contention(path: &Utf8Path) -> LockError {
        let holder_pid = Self::holder(path).ok().flatten().map(|info| info.pid);
        LockError::Contention {
            path: path.to_string(),
            holder_pid,
        }
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// The holder info this lock wrote.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl std::fmt::Debug for EntryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLock")
            .field("path", &self.path)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        // Best-effort truncate so `holder` stops reporting us, then unlock.
        let _ = self.file.set_len(0);
        sys::unlock(&self.file);
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    /// flock(2) the whole file. Returns `Ok(false)` on contention in
    /// non-blocking mode.
    pub fn lock_exclusive(file: &File, block: bool) -> io::Result<bool> {
        let mut op = libc::LOCK_EX;
        if !block {
            op |= libc::LOCK_NB;
        }
        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
            if rc == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if !block && (code == libc::EWOULDBLOCK || code == libc::EAGAIN) => {
                    return Ok(false);
                }
                _ => return Err(err),
            }
        }
    }

    pub fn unlock(file: &File) {
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::mem;
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::{LockFileEx, UnlockFileEx};
    use winapi::um::minwinbase::{
        LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED,
    };

    const ERROR_LOCK_VIOLATION: i32 = 33;

    pub fn lock_exclusive(file: &File, block: bool) -> io::Result<bool> {
        let mut flags = LOCKFILE_EXCLUSIVE_LOCK;
        if !block {
            flags |= LOCKFILE_FAIL_IMMEDIATELY;
        }
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        let ok = unsafe {
            LockFileEx(
                file.as_raw_handle().cast(),
                flags,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            )
        };
        if ok != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if !block && err.raw_os_error() == Some(ERROR_LOCK_VIOLATION) {
            return Ok(false);
        }
        Err(err)
    }

    pub fn unlock(file: &File) {
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        unsafe {
            UnlockFileEx(file.as_raw_handle().cast(), 0, u32::MAX, u32::MAX, &mut overlapped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn lock_path(td: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(td.path().join("packages.test.lock")).unwrap()
    }

    #[test]
    fn test_acquire_and_release() {
        let td = TempDir::new().unwrap();
        let path = lock_path(&td);

        let lock = EntryLock::try_acquire(&path, "a@1").unwrap().unwrap();
        assert_eq!(lock.info().pid, process::id());
        assert_eq!(lock.info().key, "a@1");
        drop(lock);

        // Re-acquirable after release.
        let again = EntryLock::try_acquire(&path, "a@1").unwrap();
        assert!(again.is_some());
    }

    #[test]
    fn test_contention_within_process_threads() {
        // flock is per open-file-description, so a second open in another
        // thread observes contention just as a second process would.
        let td = TempDir::new().unwrap();
        let path = lock_path(&td);

        let held = EntryLock::try_acquire(&path, "a@1").unwrap().unwrap();
        let p = path.clone();
        let contended = std::thread::spawn(move || {
            EntryLock::try_acquire(&p, "a@1").map(|o| o.is_some())
        })
        .join()
        .unwrap()
        .unwrap();
        assert!(!contended, "second acquisition must observe contention");
        drop(held);
    }

    #[test]
    fn test_blocking_acquire_waits_for_release() {
        let td = TempDir::new().unwrap();
        let path = lock_path(&td);

        let held = EntryLock::try_acquire(&path, "a@1").unwrap().unwrap();
        let p = path.clone();
        let waiter = std::thread::spawn(move || {
            EntryLock::acquire(&p, "a@1", 0, Duration::from_millis(10)).map(|l| l.info().pid)
        });

        std::thread::sleep(Duration::from_millis(50));
        drop(held);

        let pid = waiter.join().unwrap().unwrap();
        assert_eq!(pid, process::id());
    }

    #[test]
    fn test_holder_reports_current_owner() {
        let td = TempDir::new().unwrap();
        let path = lock_path(&td);

        assert!(EntryLock::holder(&path).unwrap().is_none());

        let lock = EntryLock::try_acquire(&path, "pkg.z@2").unwrap().unwrap();
        let holder = EntryLock::holder(&path).unwrap().unwrap();
        assert_eq!(holder.pid, process::id());
        assert_eq!(holder.key, "pkg.z@2");
        assert!(!holder.engine_version.is_empty());
        drop(lock);

        // Release truncates the sidecar.
        assert!(EntryLock::holder(&path).unwrap().is_none());
    }

    #[test]
    fn test_contention_error_names_holder() {
        let td = TempDir::new().unwrap();
        let path = lock_path(&td);
        let _lock = EntryLock::try_acquire(&path, "a@1").unwrap().unwrap();

        let err = EntryLock::contention(&path);
        match err {
            LockError::Contention { holder_pid, .. } => {
                assert_eq!(holder_pid, Some(process::id()));
            }
            other => panic!("expected contention, got {other:?}"),
        }
    }
}
