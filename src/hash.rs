//! Content hashing shims.
//!
//! All digests in the engine are BLAKE3. Callers that need a short
//! filesystem-friendly token take a hex prefix via [`hex_prefix`].

use camino::Utf8Path;
use std::fs::File;
use std::io::{self, Read};

/// Length in bytes of a full digest.
pub const DIGEST_LEN: usize = 32;

/// Digest an in-memory byte string.
#[must_use]
pub fn digest(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    *blake3::hash(bytes).as_bytes()
}

/// Digest an in-memory byte string and render it as lowercase hex.
#[must_use]
pub fn digest_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Render the first `n` bytes of a digest as lowercase hex.
#[must_use]
pub fn hex_prefix(digest: &[u8; DIGEST_LEN], n: usize) -> String {
    let n = n.min(DIGEST_LEN);
    let mut out = String::with_capacity(n * 2);
    for b in &digest[..n] {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Digest a file's contents without reading it fully into memory.
pub fn digest_file(path: &Utf8Path) -> io::Result<[u8; DIGEST_LEN]> {
    let mut file = File::open(path.as_std_path())?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

/// Hex-render a file digest.
pub fn digest_file_hex(path: &Utf8Path) -> io::Result<String> {
    Ok(hex_prefix(&digest_file(path)?, DIGEST_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(digest(b"galley"), digest(b"galley"));
        assert_ne!(digest(b"galley"), digest(b"galley "));
    }

    #[test]
    fn test_hex_prefix_lengths() {
        let d = digest(b"abc");
        assert_eq!(hex_prefix(&d, 8).len(), 16);
        assert_eq!(hex_prefix(&d, 32).len(), 64);
        // Oversized prefixes clamp to the digest length.
        assert_eq!(hex_prefix(&d, 99), hex_prefix(&d, 32));
        assert_eq!(hex_prefix(&d, 32), digest_hex(b"abc"));
    }

    #[test]
    fn test_file_digest_matches_memory_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload.bin");
        fs::write(&path, b"file contents").unwrap();
        let utf8 = camino::Utf8Path::from_path(&path).unwrap();
        assert_eq!(digest_file(utf8).unwrap(), digest(b"file contents"));
    }
}
