//! galley - a reproducible dependency-aware package build and cache engine
//!
//! Consumers declare recipes (`namespace.name@revision`, options,
//! dependencies, phase callbacks); the engine resolves the transitive
//! graph, drives each recipe through `fetch -> check -> stage -> build ->
//! install -> completion` on a worker pool, and stores results in a
//! content-addressed on-disk cache that is safe to share between
//! concurrent processes. Completed work is attested by rename-published
//! sentinels, so re-runs are cheap and crashes are recoverable.
//!
//! The manifest language, scheme-specific fetchers, archive extractors,
//! and any UI are external collaborators behind narrow traits; see
//! [`loader::SpecLoader`], [`fetch::Fetcher`], [`extract::Extractor`], and
//! [`runner::ShellRunner`].

/// Returns the engine version string.
#[must_use]
pub fn engine_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub mod paths;

pub mod atomic;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod graph;
pub mod hash;
pub mod identity;
pub mod loader;
pub mod lock;
pub mod logging;
pub mod options;
pub mod platform;
pub mod products;
pub mod resolver;
pub mod runner;
pub mod spec;
pub mod store;
pub mod types;

// Core types and entry points used by external consumers
pub use config::EngineConfig;
pub use engine::context::{CustomFetchContext, PhaseContext, ProductQuery};
pub use engine::{Engine, RecipeView, summarize};
pub use error::{GalleyError, LockError, PhaseError, ResolveError, StoreError};
pub use identity::{Identity, RecipeKey, format_key, variant_hash};
pub use loader::{SpecLoader, StaticLoader};
pub use products::ProductInfo;
pub use resolver::Resolver;
pub use runner::{NativeRunner, RunRequest, RunResult, ShellKind, ShellRunner};
pub use spec::{
    CheckCallback, DepSpec, FetchBodyCallback, FetchSource, InlineBody, PhaseCallback,
    ProductTarget, ProductsCallback, ProductsDecl, RecipeSpec, SpecBuilder, SpecPool, StrongDep,
};
pub use store::{CacheStore, PkgEntry, PkgHandle, SpecEntry, SpecHandle};
pub use types::{CheckOutcome, Phase, PhaseState, RecipeOutcome, RecipeType};
