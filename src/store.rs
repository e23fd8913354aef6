//! Content-addressed on-disk cache shared by concurrent processes.
//!
//! Layout, rooted at the resolved cache root:
//!
//! ```text
//! <root>/
//!   pkg/<platform>/<arch>/<identity>/<variant_hash>/
//!     fetch/ stage/ install/ tmp/
//!     .complete-fetch .complete-install
//!   spec/<identity>/{source, .complete}
//!   locks/{packages.<key>.lock, spec.<identity>.lock}
//!   shell/hook.<ext>
//! ```
//!
//! Completion is attested exclusively by rename-published sentinels; locks
//! serialize writers but are never needed to trust a completed entry. A
//! handle released without `mark_*_complete` leaves the sentinel absent, so
//! the next holder re-runs the phase.

use crate::atomic;
use crate::error::StoreError;
use crate::identity::{Identity, RecipeKey};
use crate::lock::EntryLock;
use crate::paths::{self, filename_token};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::time::Duration;
use tracing::debug;

/// Sentinel attesting a completed fetch phase.
pub const FETCH_SENTINEL: &str = ".complete-fetch";
/// Sentinel attesting a completed install; its presence makes `install/`
/// authoritative and immutable.
pub const INSTALL_SENTINEL: &str = ".complete-install";
/// Sentinel attesting a committed spec source.
pub const SPEC_SENTINEL: &str = ".complete";
/// Canonical recipe body filename inside a spec entry.
pub const SPEC_SOURCE_FILE: &str = "source";

const ARCHIVE_HASH_TOKEN: &str = "-blake3-";
const ARCHIVE_SUFFIX: &str = ".tar.zst";

const DEFAULT_LOCK_RETRIES: u32 = 3;
const DEFAULT_LOCK_BACKOFF: Duration = Duration::from_millis(50);

/// Handle to one cache root. Cheap to clone; all state lives on disk.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Utf8PathBuf,
    lock_retries: u32,
    lock_backoff: Duration,
}

impl CacheStore {
    /// Open (creating if needed) the cache at the resolved root; see
    /// `paths::resolve_cache_root` for precedence.
    pub fn open(explicit: Option<&Utf8Path>) -> Result<Self, StoreError> {
        Self::open_at(&paths::resolve_cache_root(explicit))
    }

    /// Open (creating if needed) the cache at exactly `root`.
    pub fn open_at(root: &Utf8Path) -> Result<Self, StoreError> {
        let store = Self {
            root: root.to_path_buf(),
            lock_retries: DEFAULT_LOCK_RETRIES,
            lock_backoff: DEFAULT_LOCK_BACKOFF,
        };
        for sub in ["pkg", "spec", "locks", "shell"] {
            let dir = store.root.join(sub);
            paths::ensure_dir_all(&dir).map_err(|e| StoreError::Io {
                path: dir.to_string(),
                source: e,
            })?;
        }
        Ok(store)
    }

    /// The cache root directory.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directory of one package entry. Pure path computation.
    #[must_use]
    pub fn pkg_entry_dir(
        &self,
        identity: &Identity,
        platform: &str,
        arch: &str,
        variant_hash: &str,
    ) -> Utf8PathBuf {
        self.root
            .join("pkg")
            .join(platform)
            .join(arch)
            .join(filename_token(identity.as_str()))
            .join(variant_hash)
    }

    /// Final installed payload path of one package entry. Pure path
    /// computation; does not imply the entry exists or is complete.
    #[must_use]
    pub fn compute_pkg_path(
        &self,
        identity: &Identity,
        platform: &str,
        arch: &str,
        variant_hash: &str,
    ) -> Utf8PathBuf {
        self.pkg_entry_dir(identity, platform, arch, variant_hash)
            .join("install")
    }

    /// Directory of one spec entry.
    #[must_use]
    pub fn spec_dir(&self, identity: &Identity) -> Utf8PathBuf {
        self.root.join("spec").join(filename_token(identity.as_str()))
    }

    fn pkg_lock_path(&self, key: &RecipeKey) -> Utf8PathBuf {
        self.root
            .join("locks")
            .join(format!("packages.{}.lock", filename_token(key.as_str())))
    }

    fn spec_lock_path(&self, identity: &Identity) -> Utf8PathBuf {
        self.root
            .join("locks")
            .join(format!("spec.{}.lock", filename_token(identity.as_str())))
    }

    /// Ensure a package entry exists and return access to it.
    ///
    /// Fast path: when `.complete-install` is already present the entry is
    /// published and immutable; no lock is taken and `lock` is `None`.
    /// Slow path: the exclusive entry lock is acquired (blocking on other
    /// processes), completion is re-checked under the lock, and a write
    /// handle is returned.
    pub fn ensure_pkg(
        &self,
        identity: &Identity,
        platform: &str,
        arch: &str,
        variant_hash: &str,
        key: &RecipeKey,
    ) -> Result<PkgEntry, StoreError> {
        let entry_dir = self.pkg_entry_dir(identity, platform, arch, variant_hash);
        let pkg_path = entry_dir.join("install");

        if entry_dir.join(INSTALL_SENTINEL).exists() {
            debug!(entry = %entry_dir, "pkg entry complete (fast path)");
            return Ok(PkgEntry {
                entry_dir,
                pkg_path,
                lock: None,
            });
        }

        let lock_path = self.pkg_lock_path(key);
        let lock = EntryLock::acquire(
            &lock_path,
            key.as_str(),
            self.lock_retries,
            self.lock_backoff,
        )?;

        // Another process may have completed the entry while we waited.
        if entry_dir.join(INSTALL_SENTINEL).exists() {
            debug!(entry = %entry_dir, "pkg entry completed while waiting for lock");
            return Ok(PkgEntry {
                entry_dir,
                pkg_path,
                lock: None,
            });
        }

        paths::ensure_dir_all(&entry_dir).map_err(|e| StoreError::Io {
            path: entry_dir.to_string(),
            source: e,
        })?;

        Ok(PkgEntry {
            entry_dir: entry_dir.clone(),
            pkg_path,
            lock: Some(PkgHandle {
                entry_dir,
                _lock: lock,
            }),
        })
    }

    /// The committed spec source path for `identity`, or `None` when the
    /// entry is absent or incomplete. Lock-free read of published state.
    #[must_use]
    pub fn spec_source_if_complete(&self, identity: &Identity) -> Option<Utf8PathBuf> {
        let dir = self.spec_dir(identity);
        dir.join(SPEC_SENTINEL)
            .exists()
            .then(|| dir.join(SPEC_SOURCE_FILE))
    }

    /// Ensure a spec entry exists and return access to it; same fast/slow
    /// path discipline as [`ensure_pkg`](Self::ensure_pkg).
    pub fn ensure_spec(&self, identity: &Identity) -> Result<SpecEntry, StoreError> {
        let dir = self.spec_dir(identity);
        let source_path = dir.join(SPEC_SOURCE_FILE);

        if dir.join(SPEC_SENTINEL).exists() {
            return Ok(SpecEntry {
                dir,
                source_path,
                lock: None,
            });
        }

        let lock_path = self.spec_lock_path(identity);
        let lock = EntryLock::acquire(
            &lock_path,
            identity.as_str(),
            self.lock_retries,
            self.lock_backoff,
        )?;

        if dir.join(SPEC_SENTINEL).exists() {
            return Ok(SpecEntry {
                dir,
                source_path,
                lock: None,
            });
        }

        paths::ensure_dir_all(&dir).map_err(|e| StoreError::Io {
            path: dir.to_string(),
            source: e,
        })?;

        Ok(SpecEntry {
            dir: dir.clone(),
            source_path,
            lock: Some(SpecHandle { dir, _lock: lock }),
        })
    }

    /// Remove a package entry entirely (cache maintenance). Takes the
    /// entry lock first so a concurrent writer is never yanked mid-phase.
    pub fn purge_pkg(
        &self,
        identity: &Identity,
        platform: &str,
        arch: &str,
        variant_hash: &str,
        key: &RecipeKey,
    ) -> Result<(), StoreError> {
        let lock_path = self.pkg_lock_path(key);
        let _lock = EntryLock::acquire(
            &lock_path,
            key.as_str(),
            self.lock_retries,
            self.lock_backoff,
        )?;
        remove_dir_if_present(&self.pkg_entry_dir(identity, platform, arch, variant_hash))
    }

    /// Remove a spec entry entirely.
    pub fn purge_spec(&self, identity: &Identity) -> Result<(), StoreError> {
        let dir = self.spec_dir(identity);
        remove_dir_if_present(&dir)
    }

    /// Publish a shell integration hook at `shell/hook.<ext>`.
    pub fn write_shell_hook(&self, ext: &str, content: &str) -> Result<Utf8PathBuf, StoreError> {
        let path = self.root.join("shell").join(format!("hook.{ext}"));
        atomic::write_file_atomic(&path, content.as_bytes())?;
        Ok(path)
    }
}

fn remove_dir_if_present(dir: &Utf8Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(dir.as_std_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::Io {
            path: dir.to_string(),
            source: e,
        }),
    }
}

/// Result of [`CacheStore::ensure_pkg`].
#[derive(Debug)]
pub struct PkgEntry {
    /// The entry directory.
    pub entry_dir: Utf8PathBuf,
    /// The final installed payload path (`<entry>/install`). Authoritative
    /// only when the entry is complete.
    pub pkg_path: Utf8PathBuf,
    /// Write handle; `None` when the entry is already published.
    pub lock: Option<PkgHandle>,
}

impl PkgEntry {
    /// True when the entry was already complete and no lock was taken.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.lock.is_none()
    }
}

/// Exclusive write handle to an incomplete package entry.
///
/// Dropping the handle without marking releases the lock and leaves the
/// entry in whatever partial state exists on disk; absent sentinels cause
/// the corresponding phases to be re-done by the next holder.
#[derive(Debug)]
pub struct PkgHandle {
    entry_dir: Utf8PathBuf,
    _lock: EntryLock,
}

impl PkgHandle {
    /// The entry directory.
    #[must_use]
    pub fn entry_dir(&self) -> &Utf8Path {
        &self.entry_dir
    }

    /// Raw download area. Re-entrant across crashes: partial contents are
    /// permitted, individual downloads are keyed by source.
    pub fn fetch_dir(&self) -> Result<Utf8PathBuf, StoreError> {
        self.subdir("fetch")
    }

    /// Extracted and patched source tree.
    pub fn stage_dir(&self) -> Result<Utf8PathBuf, StoreError> {
        self.subdir("stage")
    }

    /// Installation staging area. Assembled under `stage/` and renamed to
    /// `install/` wholesale at [`mark_install_complete`](Self::mark_install_complete).
    pub fn install_dir(&self) -> Result<Utf8PathBuf, StoreError> {
        self.subdir("stage/install")
    }

    /// Scratch space; may be purged at any time between runs.
    pub fn tmp_dir(&self) -> Result<Utf8PathBuf, StoreError> {
        self.subdir("tmp")
    }

    /// Drop any leftover install staging tree and recreate it empty.
    /// Install is re-done from scratch after a crashed attempt; stale
    /// staged files must not leak into the published payload.
    pub fn reset_install_staging(&self) -> Result<Utf8PathBuf, StoreError> {
        let staging = self.entry_dir.join("stage/install");
        match fs::remove_dir_all(staging.as_std_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StoreError::Io {
                    path: staging.to_string(),
                    source: e,
                });
            }
        }
        self.subdir("stage/install")
    }

    fn subdir(&self, name: &str) -> Result<Utf8PathBuf, StoreError> {
        let dir = self.entry_dir.join(name);
        paths::ensure_dir_all(&dir).map_err(|e| StoreError::Io {
            path: dir.to_string(),
            source: e,
        })?;
        Ok(dir)
    }

    /// Whether the fetch phase of this entry already completed.
    #[must_use]
    pub fn fetch_complete(&self) -> bool {
        self.entry_dir.join(FETCH_SENTINEL).exists()
    }

    /// Attest fetch completion.
    pub fn mark_fetch_complete(&self) -> Result<(), StoreError> {
        atomic::touch_sentinel(&self.entry_dir.join(FETCH_SENTINEL))?;
        Ok(())
    }

    /// Publish the staged install tree as `install/` and attest completion.
    pub fn mark_install_complete(&self) -> Result<(), StoreError> {
        let staging = self.entry_dir.join("stage/install");
        if !staging.is_dir() {
            return Err(StoreError::Io {
                path: staging.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "install staging directory was never populated",
                ),
            });
        }
        atomic::publish_dir(&staging, &self.entry_dir.join("install"))?;
        atomic::touch_sentinel(&self.entry_dir.join(INSTALL_SENTINEL))?;
        Ok(())
    }

    /// Remove the whole entry (user-managed recipes leave no artifact).
    /// Consumes the handle; the lock is released after removal.
    pub fn purge_entry(self) -> Result<(), StoreError> {
        remove_dir_if_present(&self.entry_dir)
    }
}

/// Result of [`CacheStore::ensure_spec`].
#[derive(Debug)]
pub struct SpecEntry {
    /// The spec entry directory.
    pub dir: Utf8PathBuf,
    /// Path of the canonical recipe body.
    pub source_path: Utf8PathBuf,
    /// Write handle; `None` when the source is already committed.
    pub lock: Option<SpecHandle>,
}

impl SpecEntry {
    /// True when the spec source is already committed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.lock.is_none()
    }
}

/// Exclusive write handle to an uncommitted spec entry.
#[derive(Debug)]
pub struct SpecHandle {
    dir: Utf8PathBuf,
    _lock: EntryLock,
}

impl SpecHandle {
    /// Commit the canonical recipe body and attest completion.
    pub fn commit_source(&self, body: &[u8]) -> Result<Utf8PathBuf, StoreError> {
        let source_path = self.dir.join(SPEC_SOURCE_FILE);
        atomic::write_file_atomic(&source_path, body)?;
        atomic::touch_sentinel(&self.dir.join(SPEC_SENTINEL))?;
        Ok(source_path)
    }
}

/// Render the archive filename for an exported package entry:
/// `<identity>-<platform>-<arch>-blake3-<variant_hash>.tar.zst`.
#[must_use]
pub fn format_archive_filename(
    identity: &Identity,
    platform: &str,
    arch: &str,
    variant_hash: &str,
) -> String {
    format!("{identity}-{platform}-{arch}{ARCHIVE_HASH_TOKEN}{variant_hash}{ARCHIVE_SUFFIX}")
}

/// Parse an archive filename back into `(identity, platform, arch,
/// variant_hash)`. Exact inverse of [`format_archive_filename`]; the
/// `-blake3-` token is mandatory.
pub fn parse_archive_filename(
    name: &str,
) -> Result<(Identity, String, String, String), StoreError> {
    let bad = || StoreError::BadArchiveName {
        name: name.to_string(),
    };

    let stem = name.strip_suffix(ARCHIVE_SUFFIX).ok_or_else(bad)?;
    let (left, variant_hash) = stem.rsplit_once(ARCHIVE_HASH_TOKEN).ok_or_else(bad)?;
    if variant_hash.len() != 16 || !variant_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(bad());
    }

    // platform and arch never contain '-'; the identity may.
    let (rest, arch) = left.rsplit_once('-').ok_or_else(bad)?;
    let (identity_str, platform) = rest.rsplit_once('-').ok_or_else(bad)?;
    if platform.is_empty() || arch.is_empty() {
        return Err(bad());
    }
    let identity = Identity::parse(identity_str).map_err(|_| bad())?;

    Ok((
        identity,
        platform.to_string(),
        arch.to_string(),
        variant_hash.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::format_key;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, CacheStore) {
        let td = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        let store = CacheStore::open_at(&root).unwrap();
        (td, store)
    }

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    #[test]
    fn test_open_creates_subtrees() {
        let (_td, store) = open_store();
        for sub in ["pkg", "spec", "locks", "shell"] {
            assert!(store.root().join(sub).is_dir(), "missing {sub}/");
        }
    }

    #[test]
    fn test_pkg_paths_are_pure_and_stable() {
        let (_td, store) = open_store();
        let identity = id("net.curl@8");
        let entry = store.pkg_entry_dir(&identity, "linux", "x86_64", "aabbccdd00112233");
        assert!(entry.as_str().ends_with("pkg/linux/x86_64/net.curl@8/aabbccdd00112233"));
        assert_eq!(
            store.compute_pkg_path(&identity, "linux", "x86_64", "aabbccdd00112233"),
            entry.join("install")
        );
        // No directories were created.
        assert!(!entry.exists());
    }

    #[test]
    fn test_ensure_pkg_slow_path_then_fast_path() {
        let (_td, store) = open_store();
        let identity = id("a@1");
        let key = format_key(&identity, "");

        let entry = store
            .ensure_pkg(&identity, "linux", "x86_64", "0011223344556677", &key)
            .unwrap();
        assert!(!entry.is_complete());
        let handle = entry.lock.unwrap();

        // Populate the staged install tree and complete the entry.
        let staging = handle.install_dir().unwrap();
        fs::write(staging.join("payload").as_std_path(), b"bits").unwrap();
        handle.mark_fetch_complete().unwrap();
        handle.mark_install_complete().unwrap();
        drop(handle);

        let again = store
            .ensure_pkg(&identity, "linux", "x86_64", "0011223344556677", &key)
            .unwrap();
        assert!(again.is_complete());
        assert!(again.pkg_path.join("payload").exists());
    }

    #[test]
    fn test_release_without_mark_leaves_entry_incomplete() {
        let (_td, store) = open_store();
        let identity = id("a@1");
        let key = format_key(&identity, "");

        {
            let entry = store
                .ensure_pkg(&identity, "linux", "x86_64", "0011223344556677", &key)
                .unwrap();
            let handle = entry.lock.unwrap();
            let staging = handle.install_dir().unwrap();
            fs::write(staging.join("partial").as_std_path(), b"half").unwrap();
            // Dropped without mark_install_complete: simulated crash.
        }

        let entry = store
            .ensure_pkg(&identity, "linux", "x86_64", "0011223344556677", &key)
            .unwrap();
        assert!(!entry.is_complete(), "absent sentinel must force re-run");
        // The partial staging tree is still there for inspection, but the
        // published install dir is not.
        assert!(!entry.pkg_path.exists());
    }

    #[test]
    fn test_mark_install_complete_requires_staged_tree() {
        let (_td, store) = open_store();
        let identity = id("a@1");
        let key = format_key(&identity, "");

        let entry = store
            .ensure_pkg(&identity, "linux", "x86_64", "0011223344556677", &key)
            .unwrap();
        let handle = entry.lock.unwrap();
        let err = handle.mark_install_complete().unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[test]
    fn test_concurrent_ensure_pkg_single_writer() {
        let (_td, store) = open_store();
        let identity = id("contended@1");
        let key = format_key(&identity, "");

        let entry = store
            .ensure_pkg(&identity, "linux", "x86_64", "0011223344556677", &key)
            .unwrap();
        let handle = entry.lock.unwrap();

        let store2 = store.clone();
        let identity2 = identity.clone();
        let key2 = key.clone();
        let waiter = std::thread::spawn(move || {
            // Blocks until the writer completes, then observes fast path.
            store2
                .ensure_pkg(&identity2, "linux", "x86_64", "0011223344556677", &key2)
                .map(|e| e.is_complete())
        });

        std::thread::sleep(Duration::from_millis(50));
        let staging = handle.install_dir().unwrap();
        fs::write(staging.join("payload").as_std_path(), b"bits").unwrap();
        handle.mark_install_complete().unwrap();
        drop(handle);

        assert!(waiter.join().unwrap().unwrap());
    }

    #[test]
    fn test_purge_entry_removes_everything() {
        let (_td, store) = open_store();
        let identity = id("u@1");
        let key = format_key(&identity, "");

        let entry = store
            .ensure_pkg(&identity, "linux", "x86_64", "0011223344556677", &key)
            .unwrap();
        let dir = entry.entry_dir.clone();
        let handle = entry.lock.unwrap();
        handle.fetch_dir().unwrap();
        handle.purge_entry().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_store_level_purge_pkg() {
        let (_td, store) = open_store();
        let identity = id("gone@1");
        let key = format_key(&identity, "");

        {
            let entry = store
                .ensure_pkg(&identity, "linux", "x86_64", "0011223344556677", &key)
                .unwrap();
            let handle = entry.lock.unwrap();
            let staging = handle.install_dir().unwrap();
            fs::write(staging.join("payload").as_std_path(), b"bits").unwrap();
            handle.mark_install_complete().unwrap();
        }

        store
            .purge_pkg(&identity, "linux", "x86_64", "0011223344556677", &key)
            .unwrap();
        assert!(
            !store
                .pkg_entry_dir(&identity, "linux", "x86_64", "0011223344556677")
                .exists()
        );
        // Purging an absent entry is a no-op.
        store
            .purge_pkg(&identity, "linux", "x86_64", "0011223344556677", &key)
            .unwrap();
    }

    #[test]
    fn test_ensure_spec_commit_and_fast_path() {
        let (_td, store) = open_store();
        let identity = id("tools.ninja@1.11");

        let entry = store.ensure_spec(&identity).unwrap();
        assert!(!entry.is_complete());
        let source_path = entry
            .lock
            .as_ref()
            .unwrap()
            .commit_source(b"recipe body")
            .unwrap();
        assert_eq!(
            fs::read(source_path.as_std_path()).unwrap(),
            b"recipe body"
        );
        drop(entry);

        let again = store.ensure_spec(&identity).unwrap();
        assert!(again.is_complete());
        assert!(again.source_path.exists());

        store.purge_spec(&identity).unwrap();
        assert!(!store.spec_dir(&identity).exists());
    }

    #[test]
    fn test_shell_hook_published_under_shell_dir() {
        let (_td, store) = open_store();
        let path = store.write_shell_hook("sh", "export GALLEY=1\n").unwrap();
        assert!(path.as_str().ends_with("shell/hook.sh"));
        assert_eq!(
            fs::read_to_string(path.as_std_path()).unwrap(),
            "export GALLEY=1\n"
        );
    }

    #[test]
    fn test_archive_filename_round_trip() {
        let identity = id("arm.gcc@13.2");
        let name = format_archive_filename(&identity, "linux", "x86_64", "00112233aabbccdd");
        assert_eq!(name, "arm.gcc@13.2-linux-x86_64-blake3-00112233aabbccdd.tar.zst");

        let (i, p, a, h) = parse_archive_filename(&name).unwrap();
        assert_eq!(i, identity);
        assert_eq!(p, "linux");
        assert_eq!(a, "x86_64");
        assert_eq!(h, "00112233aabbccdd");
    }

    #[test]
    fn test_archive_filename_rejects_malformed_names() {
        for bad in [
            "a@1-linux-x86_64-sha256-0011223344556677.tar.zst", // wrong hash token
            "a@1-linux-x86_64-blake3-0011.tar.zst",             // short hash
            "a@1-linux-x86_64-blake3-0011223344556677.tar.gz",  // wrong suffix
            "a@1-blake3-0011223344556677.tar.zst",              // missing platform/arch
            "not an archive",
        ] {
            assert!(
                parse_archive_filename(bad).is_err(),
                "expected rejection of {bad}"
            );
        }
    }
}
