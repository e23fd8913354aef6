//! Host platform shims: OS/arch names and the default cache location.

use camino::Utf8PathBuf;

/// Short OS name used in cache paths and archive names (`linux`, `macos`,
/// `windows`, ...).
#[must_use]
pub fn os_name() -> &'static str {
    std::env::consts::OS
}

/// CPU architecture name used in cache paths and archive names (`x86_64`,
/// `aarch64`, ...).
#[must_use]
pub fn arch_name() -> &'static str {
    std::env::consts::ARCH
}

/// Platform default cache root: `<user cache dir>/galley`, falling back to
/// a `.galley` directory relative to the working directory when the user
/// cache dir cannot be determined (some containers strip `$HOME`).
#[must_use]
pub fn default_cache_root() -> Utf8PathBuf {
    if let Some(base) = dirs::cache_dir()
        && let Ok(utf8) = Utf8PathBuf::from_path_buf(base)
    {
        return utf8.join("galley");
    }
    Utf8PathBuf::from(".galley")
}
