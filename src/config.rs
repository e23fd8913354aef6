//! Engine configuration.
//!
//! Plain data with explicit precedence: a caller-supplied value beats the
//! environment, which beats the platform default. Environment inputs are
//! limited to the cache-root override; everything else arrives through
//! this struct.

use crate::runner::ShellKind;
use camino::Utf8PathBuf;
use std::collections::BTreeMap;
use std::time::Duration;

/// Runtime parameters of one engine instance.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Explicit cache root. Falls back to `GALLEY_CACHE_DIR`, then the
    /// platform default.
    pub cache_root: Option<Utf8PathBuf>,
    /// Worker-thread count; defaults to the logical CPU count.
    pub workers: Option<usize>,
    /// Extra environment merged last into every subprocess environment
    /// (the parent environment is propagated unchanged underneath).
    pub env: BTreeMap<String, String>,
    /// Per-subprocess timeout; `None` means unbounded.
    pub subprocess_timeout: Option<Duration>,
    /// Shell for recipes that do not declare one.
    pub default_shell: Option<ShellKind>,
    /// Platform name override (tests and cross-builds); defaults to the
    /// host OS name.
    pub platform: Option<String>,
    /// Architecture name override; defaults to the host architecture.
    pub arch: Option<String>,
}

impl EngineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cache_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    #[must_use]
    pub fn env_var(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub const fn subprocess_timeout(mut self, timeout: Duration) -> Self {
        self.subprocess_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn default_shell(mut self, shell: ShellKind) -> Self {
        self.default_shell = Some(shell);
        self
    }

    #[must_use]
    pub fn target(mut self, platform: &str, arch: &str) -> Self {
        self.platform = Some(platform.to_string());
        self.arch = Some(arch.to_string());
        self
    }
}
