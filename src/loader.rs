//! The manifest-loader boundary.
//!
//! Manifest evaluation (the embedded scripting language) is external to the
//! engine. The resolver only needs two operations: load the spec a
//! dependency declares, and load a spec body previously committed to the
//! spec cache by a custom-fetch callback. Implementations own all
//! evaluation concerns; the engine treats failures opaquely.

use crate::identity::Identity;
use crate::spec::RecipeSpec;
use camino::Utf8Path;
use parking_lot::Mutex;
use std::collections::HashMap;

/// External manifest evaluator.
pub trait SpecLoader: Send + Sync {
    /// Load the spec for `identity` from its declared source. The source
    /// has already been fetched into the spec cache when this is called;
    /// `source_path` is the canonical recipe body.
    fn load(&self, identity: &Identity, source_path: &Utf8Path) -> anyhow::Result<RecipeSpec>;
}

/// In-memory loader backed by pre-built specs, keyed by identity.
///
/// Serves two purposes: unit/integration tests, and consumers that evaluate
/// all manifests up front and hand the engine finished records.
#[derive(Default)]
pub struct StaticLoader {
    specs: Mutex<HashMap<Identity, Box<dyn Fn() -> RecipeSpec + Send + Sync>>>,
}

impl StaticLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec factory for `identity`. The factory is invoked each
    /// time the resolver asks for the identity; it must produce an
    /// equivalent spec every time.
    pub fn register<F>(&self, identity: Identity, factory: F)
    where
        F: Fn() -> RecipeSpec + Send + Sync + 'static,
    {
        self.specs.lock().insert(identity, Box::new(factory));
    }
}

impl SpecLoader for StaticLoader {
    fn load(&self, identity: &Identity, _source_path: &Utf8Path) -> anyhow::Result<RecipeSpec> {
        let specs = self.specs.lock();
        let factory = specs
            .get(identity)
            .ok_or_else(|| anyhow::anyhow!("no spec registered for '{identity}'"))?;
        Ok(factory())
    }
}

impl std::fmt::Debug for StaticLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StaticLoader({} specs)", self.specs.lock().len())
    }
}
