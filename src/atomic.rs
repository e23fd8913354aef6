//! Atomic filesystem publication primitives.
//!
//! Everything the cache exposes to other processes is published by the same
//! move: write into a sibling temp name, fsync, rename. Sentinels are empty
//! files created the same way, so a crash between "work done" and "sentinel
//! present" can only leave the sentinel absent, never half-written.

use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use std::io::Write;

use tempfile::NamedTempFile;

/// Atomically write bytes to `path` via temp file + fsync + rename.
pub fn write_file_atomic(path: &Utf8Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    crate::paths::ensure_dir_all(parent)
        .with_context(|| format!("failed to create parent directory: {parent}"))?;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in: {parent}"))?;
    temp.write_all(content)
        .context("failed to write content to temp file")?;
    temp.as_file()
        .sync_all()
        .context("failed to fsync temp file")?;
    persist(temp, path)
}

/// Create a 0-byte sentinel at `path` via the same temp-then-rename move.
///
/// Once the sentinel is visible, any prior writes to the entry it guards
/// are also visible (rename is the publication barrier).
pub fn touch_sentinel(path: &Utf8Path) -> Result<()> {
    write_file_atomic(path, b"")
}

/// Atomically replace `dst` with the directory at `src`.
///
/// `src` and `dst` must live on the same filesystem (they do: both are
/// inside one cache entry). Any previous `dst` is removed first; a crash
/// in the window leaves `dst` absent, which readers treat the same as
/// "phase not completed" because the sentinel is written after.
pub fn publish_dir(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    if dst.exists() {
        fs::remove_dir_all(dst.as_std_path())
            .with_context(|| format!("failed to remove stale dir: {dst}"))?;
    }
    fs::rename(src.as_std_path(), dst.as_std_path())
        .with_context(|| format!("failed to publish {src} -> {dst}"))?;
    Ok(())
}

/// Rename with a bounded retry loop for transient Windows share violations.
#[cfg(target_os = "windows")]
fn persist(mut temp: NamedTempFile, target: &Utf8Path) -> Result<()> {
    use std::io::ErrorKind;
    use std::{thread, time::Duration};

    const MAX_RETRIES: u32 = 5;
    const INITIAL_DELAY_MS: u64 = 10;

    let mut retry = 0;
    loop {
        match temp.persist(target.as_std_path()) {
            Ok(_) => return Ok(()),
            Err(persist_error) => {
                let retryable = matches!(
                    persist_error.error.kind(),
                    ErrorKind::PermissionDenied | ErrorKind::Other
                );
                if retry >= MAX_RETRIES || !retryable {
                    return Err(anyhow::anyhow!(persist_error.error))
                        .with_context(|| format!("failed to persist {target}"));
                }
                thread::sleep(Duration::from_millis(INITIAL_DELAY_MS << retry));
                retry += 1;
                temp = persist_error.file;
            }
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn persist(temp: NamedTempFile, target: &Utf8Path) -> Result<()> {
    temp.persist(target.as_std_path())
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!(e.error))
        .with_context(|| format!("failed to persist {target}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let td = TempDir::new().unwrap();
        let path = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        (td, path)
    }

    #[test]
    fn test_write_file_atomic_basic() {
        let (_td, root) = temp_root();
        let target = root.join("nested/dir/out.txt");
        write_file_atomic(&target, b"payload").unwrap();
        assert_eq!(fs::read(target.as_std_path()).unwrap(), b"payload");
    }

    #[test]
    fn test_write_file_atomic_overwrites() {
        let (_td, root) = temp_root();
        let target = root.join("out.txt");
        write_file_atomic(&target, b"first").unwrap();
        write_file_atomic(&target, b"second").unwrap();
        assert_eq!(fs::read(target.as_std_path()).unwrap(), b"second");
    }

    #[test]
    fn test_touch_sentinel_creates_empty_file() {
        let (_td, root) = temp_root();
        let sentinel = root.join(".complete-install");
        touch_sentinel(&sentinel).unwrap();
        assert!(sentinel.exists());
        assert_eq!(fs::metadata(sentinel.as_std_path()).unwrap().len(), 0);
    }

    #[test]
    fn test_publish_dir_replaces_target() {
        let (_td, root) = temp_root();
        let staging = root.join("stage/install");
        let final_dir = root.join("install");

        crate::paths::ensure_dir_all(&staging).unwrap();
        fs::write(staging.join("bin").as_std_path(), b"new").unwrap();

        crate::paths::ensure_dir_all(&final_dir).unwrap();
        fs::write(final_dir.join("bin").as_std_path(), b"old").unwrap();

        publish_dir(&staging, &final_dir).unwrap();
        assert!(!staging.exists());
        assert_eq!(
            fs::read(final_dir.join("bin").as_std_path()).unwrap(),
            b"new"
        );
    }
}
