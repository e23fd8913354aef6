//! Cache-root resolution and directory helpers.

use camino::{Utf8Path, Utf8PathBuf};
use std::cell::RefCell;

// Thread-local override used only in tests to avoid process-global env races.
thread_local! {
    static THREAD_CACHE_ROOT: RefCell<Option<Utf8PathBuf>> = const { RefCell::new(None) };
}

/// Environment variable overriding the cache root.
pub const CACHE_ROOT_ENV: &str = "GALLEY_CACHE_DIR";

/// Resolve the cache root:
/// 1) thread-local override (tests use this)
/// 2) explicit override from the caller's config
/// 3) env `GALLEY_CACHE_DIR` (opt-in for users/CI)
/// 4) platform default (`<user cache dir>/galley`, or `.galley`)
#[must_use]
pub fn resolve_cache_root(explicit: Option<&Utf8Path>) -> Utf8PathBuf {
    if let Some(tl) = THREAD_CACHE_ROOT.with(|tl| tl.borrow().clone()) {
        return tl;
    }
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(p) = std::env::var(CACHE_ROOT_ENV) {
        return Utf8PathBuf::from(p);
    }
    crate::platform::default_cache_root()
}

/// mkdir -p; treat `AlreadyExists` as success (removes TOCTTOU races)
pub fn ensure_dir_all<P: AsRef<std::path::Path>>(p: P) -> std::io::Result<()> {
    match std::fs::create_dir_all(&p) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Map a key or identity to a filename-safe token. Keys may embed the
/// canonical option JSON, which carries characters some filesystems reject.
#[must_use]
pub fn filename_token(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// Test helper: point this thread's cache root at a fresh temp dir.
///
/// Hold the `TempDir` for the test's duration so the directory stays alive.
#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(not(test), allow(dead_code))]
#[must_use]
pub fn with_isolated_cache() -> tempfile::TempDir {
    let td = tempfile::TempDir::new().expect("create temp cache root");
    let p = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
    THREAD_CACHE_ROOT.with(|tl| *tl.borrow_mut() = Some(p));
    td
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_local_override_wins() {
        let td = with_isolated_cache();
        let root = resolve_cache_root(None);
        assert_eq!(root.as_std_path(), td.path());

        // Even over an explicit override.
        let root = resolve_cache_root(Some(Utf8Path::new("/elsewhere")));
        assert_eq!(root.as_std_path(), td.path());
    }

    #[test]
    fn test_explicit_override_beats_env_and_default() {
        // Fresh thread: no thread-local override installed there.
        std::thread::spawn(|| {
            let root = resolve_cache_root(Some(Utf8Path::new("/explicit/cache")));
            assert_eq!(root, Utf8PathBuf::from("/explicit/cache"));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_filename_token_replaces_reserved_chars() {
        assert_eq!(filename_token("a.b@1?{\"x\":1}"), "a.b@1_{_x__1}");
        assert_eq!(filename_token("plain-name@r1"), "plain-name@r1");
    }

    #[test]
    fn test_ensure_dir_all_is_idempotent() {
        let td = tempfile::TempDir::new().unwrap();
        let nested = td.path().join("a/b/c");
        ensure_dir_all(&nested).unwrap();
        ensure_dir_all(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
