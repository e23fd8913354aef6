//! Extractor shim.
//!
//! Real archive formats are handled by external collaborators; the engine
//! ships a directory/file copier sufficient for fixtures and for manifests
//! whose sources are pre-extracted trees. Returns the number of filesystem
//! entries written so callers can log meaningful progress.

use crate::error::PhaseError;
use camino::Utf8Path;
use std::fs;

/// Unpacks one archive (or copies one tree) into `dest`.
pub trait Extractor: Send + Sync {
    fn extract(&self, archive: &Utf8Path, dest: &Utf8Path) -> Result<u64, PhaseError>;
}

/// Copies plain files and directory trees; rejects anything it cannot
/// interpret as either.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirCopyExtractor;

impl DirCopyExtractor {
    fn copy_tree(src: &Utf8Path, dest: &Utf8Path) -> std::io::Result<u64> {
        crate::paths::ensure_dir_all(dest)?;
        let mut count = 0;
        for entry in fs::read_dir(src.as_std_path())? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let from = src.join(name.as_ref());
            let to = dest.join(name.as_ref());
            if entry.file_type()?.is_dir() {
                count += Self::copy_tree(&from, &to)?;
            } else {
                fs::copy(from.as_std_path(), to.as_std_path())?;
                count += 1;
            }
        }
        Ok(count)
    }
}

impl Extractor for DirCopyExtractor {
    fn extract(&self, archive: &Utf8Path, dest: &Utf8Path) -> Result<u64, PhaseError> {
        let map_err = |e: std::io::Error| PhaseError::Extract {
            archive: archive.to_string(),
            reason: e.to_string(),
        };

        if archive.is_dir() {
            return Self::copy_tree(archive, dest).map_err(map_err);
        }
        if archive.is_file() {
            let name = archive.file_name().ok_or_else(|| PhaseError::Extract {
                archive: archive.to_string(),
                reason: "archive path has no file name".into(),
            })?;
            crate::paths::ensure_dir_all(dest).map_err(map_err)?;
            fs::copy(archive.as_std_path(), dest.join(name).as_std_path()).map_err(map_err)?;
            return Ok(1);
        }
        Err(PhaseError::Extract {
            archive: archive.to_string(),
            reason: "no such file or directory".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    fn utf8(td: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap()
    }

    #[test]
    fn test_copies_nested_tree_and_counts_files() {
        let src_td = TempDir::new().unwrap();
        let dst_td = TempDir::new().unwrap();
        let src = utf8(&src_td);
        let dest = utf8(&dst_td).join("stage");

        crate::paths::ensure_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt").as_std_path(), b"a").unwrap();
        fs::write(src.join("sub/b.txt").as_std_path(), b"b").unwrap();

        let count = DirCopyExtractor.extract(&src, &dest).unwrap();
        assert_eq!(count, 2);
        assert!(dest.join("a.txt").exists());
        assert!(dest.join("sub/b.txt").exists());
    }

    #[test]
    fn test_single_file_copied_into_dest() {
        let src_td = TempDir::new().unwrap();
        let dst_td = TempDir::new().unwrap();
        let file = utf8(&src_td).join("payload.bin");
        fs::write(file.as_std_path(), b"x").unwrap();

        let dest = utf8(&dst_td).join("out");
        assert_eq!(DirCopyExtractor.extract(&file, &dest).unwrap(), 1);
        assert!(dest.join("payload.bin").exists());
    }

    #[test]
    fn test_missing_archive_is_an_error() {
        let dst_td = TempDir::new().unwrap();
        let err = DirCopyExtractor
            .extract(Utf8Path::new("/nonexistent/archive"), &utf8(&dst_td))
            .unwrap_err();
        assert!(matches!(err, PhaseError::Extract { .. }));
    }
}
