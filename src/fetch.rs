//! Fetcher shim: downloads a single source into an entry's fetch area.
//!
//! Scheme-specific fetchers are external collaborators; the engine ships
//! only the local-file implementation (enough for fixtures and air-gapped
//! manifests) and a dispatching default. Downloads are keyed by source so
//! the fetch phase is re-entrant over partially populated `fetch/`
//! directories.

use crate::error::PhaseError;
use crate::hash;
use crate::spec::FetchSource;
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use tracing::debug;

/// A file the fetcher placed into the destination directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    /// Absolute path of the fetched file.
    pub path: Utf8PathBuf,
    /// Full lowercase-hex digest of the file contents.
    pub digest: String,
}

/// Downloads one source into `dest_dir`, verifying the digest when one is
/// required.
pub trait Fetcher: Send + Sync {
    fn fetch_one(
        &self,
        source: &FetchSource,
        dest_dir: &Utf8Path,
        expected_digest: Option<&str>,
    ) -> Result<FetchedFile, PhaseError>;
}

/// Fetcher for local paths and `file://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

impl LocalFetcher {
    fn resolve_path(source: &FetchSource) -> Result<Utf8PathBuf, PhaseError> {
        match source {
            FetchSource::Local(p) => Ok(p.clone()),
            FetchSource::Remote { url, .. } => url.strip_prefix("file://").map_or_else(
                || {
                    Err(PhaseError::Fetch {
                        source_id: url.clone(),
                        reason: "unsupported scheme for local fetcher".into(),
                    })
                },
                |p| Ok(Utf8PathBuf::from(p)),
            ),
            FetchSource::Inline => Err(PhaseError::Fetch {
                source_id: "<inline>".into(),
                reason: "inline sources are materialized by custom-fetch callbacks".into(),
            }),
        }
    }
}

impl Fetcher for LocalFetcher {
    fn fetch_one(
        &self,
        source: &FetchSource,
        dest_dir: &Utf8Path,
        expected_digest: Option<&str>,
    ) -> Result<FetchedFile, PhaseError> {
        let src = Self::resolve_path(source)?;
        let file_name = src.file_name().ok_or_else(|| PhaseError::Fetch {
            source_id: src.to_string(),
            reason: "source path has no file name".into(),
        })?;
        let dest = dest_dir.join(file_name);

        // Keyed by source name: an identical prior download satisfies the
        // fetch without copying again.
        if !dest.exists() {
            crate::paths::ensure_dir_all(dest_dir).map_err(|e| PhaseError::Fetch {
                source_id: src.to_string(),
                reason: format!("cannot create fetch dir: {e}"),
            })?;
            fs::copy(src.as_std_path(), dest.as_std_path()).map_err(|e| PhaseError::Fetch {
                source_id: src.to_string(),
                reason: e.to_string(),
            })?;
            debug!(source = %src, dest = %dest, "fetched local file");
        }

        let digest = hash::digest_file_hex(&dest).map_err(|e| PhaseError::Fetch {
            source_id: src.to_string(),
            reason: format!("cannot digest fetched file: {e}"),
        })?;

        if let Some(expected) = expected_digest
            && !expected.eq_ignore_ascii_case(&digest)
        {
            // A stale partial download must not satisfy future fetches.
            let _ = fs::remove_file(dest.as_std_path());
            return Err(PhaseError::HashMismatch {
                source_id: src.to_string(),
                expected: expected.to_ascii_lowercase(),
                actual: digest,
            });
        }

        Ok(FetchedFile { path: dest, digest })
    }
}

/// Dispatching fetcher used when the consumer does not supply one.
/// Local paths and `file://` URLs are handled in-process; everything else
/// is rejected with an explanatory error.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFetcher {
    local: LocalFetcher,
}

impl Fetcher for DefaultFetcher {
    fn fetch_one(
        &self,
        source: &FetchSource,
        dest_dir: &Utf8Path,
        expected_digest: Option<&str>,
    ) -> Result<FetchedFile, PhaseError> {
        match source {
            FetchSource::Local(_) => self.local.fetch_one(source, dest_dir, expected_digest),
            FetchSource::Remote { url, .. } if url.starts_with("file://") => {
                self.local.fetch_one(source, dest_dir, expected_digest)
            }
            FetchSource::Remote { url, .. } => Err(PhaseError::Fetch {
                source_id: url.clone(),
                reason: "no fetcher registered for this scheme".into(),
            }),
            FetchSource::Inline => self.local.fetch_one(source, dest_dir, expected_digest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn utf8(td: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_local_fetch_copies_and_digests() {
        let src_td = TempDir::new().unwrap();
        let dst_td = TempDir::new().unwrap();
        let src_root = utf8(&src_td);
        let dest_dir = utf8(&dst_td).join("fetch");

        let src = src_root.join("tarball.tar");
        fs::write(src.as_std_path(), b"archive bytes").unwrap();

        let fetched = LocalFetcher
            .fetch_one(&FetchSource::Local(src), &dest_dir, None)
            .unwrap();
        assert_eq!(fetched.path, dest_dir.join("tarball.tar"));
        assert_eq!(fetched.digest, hash::digest_hex(b"archive bytes"));
    }

    #[test]
    fn test_local_fetch_is_reentrant() {
        let src_td = TempDir::new().unwrap();
        let dst_td = TempDir::new().unwrap();
        let dest_dir = utf8(&dst_td);

        let src = utf8(&src_td).join("f.bin");
        fs::write(src.as_std_path(), b"v1").unwrap();

        let first = LocalFetcher
            .fetch_one(&FetchSource::Local(src.clone()), &dest_dir, None)
            .unwrap();
        // Change the origin; the existing download is reused, not refetched.
        fs::write(src.as_std_path(), b"v2").unwrap();
        let second = LocalFetcher
            .fetch_one(&FetchSource::Local(src), &dest_dir, None)
            .unwrap();
        assert_eq!(first.digest, second.digest);
    }

    #[test]
    fn test_digest_mismatch_removes_download() {
        let src_td = TempDir::new().unwrap();
        let dst_td = TempDir::new().unwrap();
        let dest_dir = utf8(&dst_td);

        let src = utf8(&src_td).join("f.bin");
        fs::write(src.as_std_path(), b"payload").unwrap();

        let bogus = "0".repeat(64);
        let err = LocalFetcher
            .fetch_one(&FetchSource::Local(src), &dest_dir, Some(&bogus))
            .unwrap_err();
        assert!(matches!(err, PhaseError::HashMismatch { .. }));
        assert!(!dest_dir.join("f.bin").exists());
    }

    #[test]
    fn test_file_url_accepted_plain_scheme_rejected() {
        let src_td = TempDir::new().unwrap();
        let dst_td = TempDir::new().unwrap();
        let dest_dir = utf8(&dst_td);

        let src = utf8(&src_td).join("f.bin");
        fs::write(src.as_std_path(), b"x").unwrap();

        let ok = DefaultFetcher::default().fetch_one(
            &FetchSource::Remote {
                url: format!("file://{src}"),
                digest: None,
            },
            &dest_dir,
            None,
        );
        assert!(ok.is_ok());

        let err = DefaultFetcher::default()
            .fetch_one(
                &FetchSource::Remote {
                    url: "https://example.invalid/f.tar".into(),
                    digest: None,
                },
                &dest_dir,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, PhaseError::Fetch { .. }));
    }
}
