//! Capability-scoped callback contexts.
//!
//! A recipe callback sees exactly three things: its own working
//! directories, the dependencies it declared, and a subprocess primitive.
//! Everything is snapshotted before the callback starts, so callbacks
//! never touch engine locks; reaching for an undeclared sibling is
//! [`PhaseError::UndeclaredAccess`].

use crate::error::PhaseError;
use crate::extract::Extractor;
use crate::fetch::{FetchedFile, Fetcher};
use crate::identity::{Identity, RecipeKey};
use crate::runner::{RunRequest, RunResult, ShellKind, ShellRunner};
use crate::spec::FetchSource;
use crate::store::CacheStore;
use crate::types::Phase;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One declared dependency, as visible to the owning recipe's callbacks.
#[derive(Debug, Clone)]
pub(crate) enum Declared {
    Recipe {
        identity: Identity,
        asset: Option<Utf8PathBuf>,
    },
    Product {
        name: String,
        value: Option<String>,
    },
}

/// Context passed to phase and check callbacks.
pub struct PhaseContext {
    pub(crate) key: RecipeKey,
    pub(crate) identity: Identity,
    pub(crate) phase: Phase,
    pub(crate) source: FetchSource,
    pub(crate) fetch_dir: Utf8PathBuf,
    pub(crate) stage_dir: Utf8PathBuf,
    pub(crate) install_dir: Utf8PathBuf,
    pub(crate) tmp_dir: Utf8PathBuf,
    pub(crate) declared: Vec<Declared>,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) shell: ShellKind,
    pub(crate) timeout: Option<Duration>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) extractor: Arc<dyn Extractor>,
    pub(crate) runner: Arc<dyn ShellRunner>,
    pub(crate) cancel: Arc<AtomicBool>,
}

impl PhaseContext {
    /// The phase this callback is running for.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub const fn key(&self) -> &RecipeKey {
        &self.key
    }

    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The recipe's declared payload source.
    #[must_use]
    pub const fn source(&self) -> &FetchSource {
        &self.source
    }

    /// Raw download area of this recipe's cache entry.
    #[must_use]
    pub fn fetch_dir(&self) -> &Utf8Path {
        &self.fetch_dir
    }

    /// Extracted/patched working tree.
    #[must_use]
    pub fn stage_dir(&self) -> &Utf8Path {
        &self.stage_dir
    }

    /// Install staging tree; its final contents become the published
    /// payload.
    #[must_use]
    pub fn install_dir(&self) -> &Utf8Path {
        &self.install_dir
    }

    /// Scratch space.
    #[must_use]
    pub fn tmp_dir(&self) -> &Utf8Path {
        &self.tmp_dir
    }

    /// True once cancellation has been requested.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Download `url` into the fetch area, verifying `digest` when given.
    pub fn fetch(&self, url: &str, digest: Option<&str>) -> Result<FetchedFile, PhaseError> {
        if self.cancelled() {
            return Err(PhaseError::Cancelled);
        }
        let source = FetchSource::Remote {
            url: url.to_string(),
            digest: digest.map(str::to_string),
        };
        self.fetcher.fetch_one(&source, &self.fetch_dir, digest)
    }

    /// Fetch the recipe's declared source into the fetch area.
    pub fn fetch_declared_source(&self) -> Result<FetchedFile, PhaseError> {
        if self.cancelled() {
            return Err(PhaseError::Cancelled);
        }
        let digest = match &self.source {
            FetchSource::Remote { digest, .. } => digest.clone(),
            _ => None,
        };
        self.fetcher
            .fetch_one(&self.source, &self.fetch_dir, digest.as_deref())
    }

    /// Unpack an archive (conventionally from the fetch area) into `dest`.
    pub fn extract(&self, archive: &Utf8Path, dest: &Utf8Path) -> Result<u64, PhaseError> {
        self.extractor.extract(archive, dest)
    }

    /// Installed payload of a declared dependency.
    ///
    /// `identity` may be a suffix pattern, the same way dependency
    /// declarations match. Undeclared identities are a capability
    /// violation, not a lookup miss.
    pub fn asset(&self, identity: &str) -> Result<Utf8PathBuf, PhaseError> {
        let pattern = Identity::parse(identity).map_err(|e| PhaseError::Callback(e.into()))?;
        for entry in &self.declared {
            if let Declared::Recipe {
                identity: declared,
                asset,
            } = entry
                && declared.matches(&pattern)
            {
                return asset.clone().ok_or_else(|| {
                    PhaseError::Callback(anyhow::anyhow!(
                        "dependency '{declared}' has no cached asset"
                    ))
                });
            }
        }
        Err(PhaseError::UndeclaredAccess {
            recipe: self.key.to_string(),
            wanted: identity.to_string(),
        })
    }

    /// Resolved value of a declared product dependency.
    pub fn product(&self, name: &str) -> Result<String, PhaseError> {
        for entry in &self.declared {
            if let Declared::Product {
                name: declared,
                value,
            } = entry
                && declared == name
            {
                return value.clone().ok_or_else(|| {
                    PhaseError::Callback(anyhow::anyhow!("product '{name}' is not resolved yet"))
                });
            }
        }
        Err(PhaseError::UndeclaredAccess {
            recipe: self.key.to_string(),
            wanted: format!("product:{name}"),
        })
    }

    /// A run request preconfigured for this recipe: stage dir as cwd, the
    /// engine environment overlay, the recipe's default shell, and the
    /// configured timeout.
    #[must_use]
    pub fn run_request(&self, script: &str) -> RunRequest {
        let mut request = RunRequest::new(script, self.stage_dir.clone()).shell(self.shell);
        request.env.extend(self.env.clone());
        request.timeout = self.timeout;
        request
    }

    /// Run a script with the defaults of [`run_request`](Self::run_request).
    pub fn run(&self, script: &str) -> Result<RunResult, PhaseError> {
        self.run_with(&self.run_request(script))
    }

    /// Run a customized request.
    pub fn run_with(&self, request: &RunRequest) -> Result<RunResult, PhaseError> {
        if self.cancelled() {
            return Err(PhaseError::Cancelled);
        }
        self.runner.run(request)
    }
}

impl std::fmt::Debug for PhaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseContext")
            .field("key", &self.key)
            .field("phase", &self.phase)
            .field("declared", &self.declared.len())
            .finish_non_exhaustive()
    }
}

/// Context passed to custom-fetch callbacks while they materialize a child
/// recipe's body during the parent's fetch phase.
pub struct CustomFetchContext {
    pub(crate) child: Identity,
    pub(crate) tmp_dir: Utf8PathBuf,
    pub(crate) store: CacheStore,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) committed: Option<Utf8PathBuf>,
}

impl CustomFetchContext {
    /// Identity of the child recipe being materialized.
    #[must_use]
    pub const fn child_identity(&self) -> &Identity {
        &self.child
    }

    /// Scratch directory the callback assembles the body in.
    #[must_use]
    pub fn tmp_dir(&self) -> &Utf8Path {
        &self.tmp_dir
    }

    /// Download a file into the scratch directory.
    pub fn fetch(&self, url: &str, digest: Option<&str>) -> Result<FetchedFile, PhaseError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(PhaseError::Cancelled);
        }
        let source = FetchSource::Remote {
            url: url.to_string(),
            digest: digest.map(str::to_string),
        };
        self.fetcher.fetch_one(&source, &self.tmp_dir, digest)
    }

    /// Publish `relative_path` (within the scratch directory) as the
    /// child's canonical recipe body in the spec cache.
    pub fn commit_fetch(&mut self, relative_path: &str) -> Result<(), PhaseError> {
        let body_path = self.tmp_dir.join(relative_path);
        let body = std::fs::read(body_path.as_std_path()).map_err(|e| PhaseError::Fetch {
            source_id: body_path.to_string(),
            reason: format!("cannot read committed body: {e}"),
        })?;

        let entry = self.store.ensure_spec(&self.child)?;
        if let Some(handle) = entry.lock.as_ref() {
            handle.commit_source(&body)?;
        }
        self.committed = Some(entry.source_path);
        Ok(())
    }

    /// Where the committed body landed, once `commit_fetch` has run.
    #[must_use]
    pub fn committed_source(&self) -> Option<&Utf8Path> {
        self.committed.as_deref()
    }
}

impl std::fmt::Debug for CustomFetchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomFetchContext")
            .field("child", &self.child)
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

/// Context handed to programmatic product callbacks after install.
#[derive(Debug)]
pub struct ProductQuery<'a> {
    /// Key of the providing recipe.
    pub key: &'a RecipeKey,
    /// Published install tree; `None` for user-managed providers.
    pub install_dir: Option<&'a Utf8Path>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::DirCopyExtractor;
    use crate::fetch::DefaultFetcher;
    use crate::identity::format_key;
    use crate::runner::NativeRunner;
    use tempfile::TempDir;

    fn ctx_with(declared: Vec<Declared>) -> (TempDir, PhaseContext) {
        let td = TempDir::new().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        let identity = Identity::parse("app@1").unwrap();
        let ctx = PhaseContext {
            key: format_key(&identity, ""),
            identity,
            phase: Phase::Build,
            source: FetchSource::Inline,
            fetch_dir: root.join("fetch"),
            stage_dir: root.clone(),
            install_dir: root.join("install"),
            tmp_dir: root.join("tmp"),
            declared,
            env: BTreeMap::new(),
            shell: ShellKind::platform_default(),
            timeout: None,
            fetcher: Arc::new(DefaultFetcher::default()),
            extractor: Arc::new(DirCopyExtractor),
            runner: Arc::new(NativeRunner::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        (td, ctx)
    }

    #[test]
    fn test_asset_matches_declared_pattern() {
        let dep = Identity::parse("vendor.arm.gcc@13").unwrap();
        let (_td, ctx) = ctx_with(vec![Declared::Recipe {
            identity: dep,
            asset: Some(Utf8PathBuf::from("/cache/install")),
        }]);

        assert_eq!(
            ctx.asset("gcc@13").unwrap(),
            Utf8PathBuf::from("/cache/install")
        );
        assert_eq!(
            ctx.asset("vendor.arm.gcc@13").unwrap(),
            Utf8PathBuf::from("/cache/install")
        );
    }

    #[test]
    fn test_undeclared_asset_is_capability_violation() {
        let (_td, ctx) = ctx_with(vec![]);
        let err = ctx.asset("other@1").unwrap_err();
        assert!(matches!(err, PhaseError::UndeclaredAccess { .. }));
    }

    #[test]
    fn test_declared_product_lookup() {
        let (_td, ctx) = ctx_with(vec![Declared::Product {
            name: "cc".into(),
            value: Some("/cache/install/bin/cc".into()),
        }]);
        assert_eq!(ctx.product("cc").unwrap(), "/cache/install/bin/cc");

        let err = ctx.product("ld").unwrap_err();
        assert!(matches!(err, PhaseError::UndeclaredAccess { .. }));
    }

    #[test]
    fn test_dependency_without_asset_is_reported() {
        let (_td, ctx) = ctx_with(vec![Declared::Recipe {
            identity: Identity::parse("sys.make@4").unwrap(),
            asset: None,
        }]);
        let err = ctx.asset("make@4").unwrap_err();
        assert!(matches!(err, PhaseError::Callback(_)), "got {err:?}");
    }

    #[test]
    #[cfg(unix)]
    fn test_run_uses_stage_dir_as_cwd() {
        let (td, ctx) = ctx_with(vec![]);
        let result = ctx.run("pwd").unwrap();
        let canonical = std::fs::canonicalize(td.path()).unwrap();
        assert_eq!(
            std::fs::canonicalize(result.stdout.trim()).unwrap(),
            canonical
        );
    }

    #[test]
    fn test_cancelled_context_refuses_work() {
        let (_td, mut ctx) = ctx_with(vec![]);
        ctx.cancel = Arc::new(AtomicBool::new(true));
        assert!(ctx.run("echo hi").unwrap_err().is_cancelled());
        assert!(ctx.fetch("file:///dev/null", None).unwrap_err().is_cancelled());
    }
}
