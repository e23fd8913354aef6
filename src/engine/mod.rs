//! Concurrent phase engine.
//!
//! A fixed pool of OS worker threads drains a shared ready-queue of
//! `(recipe, phase)` items. Nothing in the core suspends: waiting is
//! expressed by not enqueuing an item until it is ready, and workers block
//! only on the queue, on cache-entry flocks, and on child-process I/O.
//!
//! A phase becomes ready when the recipe's prior phase is done and every
//! dependency with `needed_by <= phase` has itself reached that phase.
//! Readiness is re-evaluated after every completion; a compare-and-swap on
//! the per-recipe phase word guarantees single execution. Failure is
//! terminal for the recipe and propagates to dependents as
//! `PrerequisiteFailed` without running their callbacks.

pub mod context;
pub(crate) mod state;

use crate::config::EngineConfig;
use crate::error::{GalleyError, PhaseError, ResolveError};
use crate::extract::{DirCopyExtractor, Extractor};
use crate::fetch::{DefaultFetcher, Fetcher};
use crate::graph::{DepKind, Graph, RecipeId};
use crate::identity::{Identity, RecipeKey};
use crate::loader::SpecLoader;
use crate::platform;
use crate::products::{ProductInfo, ProductRegistry};
use crate::resolver::Resolver;
use crate::runner::{NativeRunner, ShellKind, ShellRunner};
use crate::spec::{DepSpec, PhaseCallback, RecipeSpec};
use crate::store::CacheStore;
use crate::types::{Phase, RecipeOutcome, RecipeType};
use camino::{Utf8Path, Utf8PathBuf};
use context::{CustomFetchContext, Declared, PhaseContext, ProductQuery};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use state::RecipeRuntime;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info, trace, warn};

/// Mutable engine state: the graph and its parallel runtime slots.
#[derive(Default)]
struct EngineState {
    graph: Graph,
    runtimes: Vec<Arc<RecipeRuntime>>,
}

enum WorkItem {
    Run(RecipeId, Phase),
    Shutdown,
}

struct Shared {
    tx: Sender<WorkItem>,
    outstanding: AtomicUsize,
    workers: usize,
}

/// Read-only snapshot of one recipe, for external queries.
#[derive(Debug, Clone)]
pub struct RecipeView {
    pub key: RecipeKey,
    pub identity: Identity,
    pub rtype: RecipeType,
    pub variant_hash: String,
    pub asset_path: Option<Utf8PathBuf>,
    pub products: Option<BTreeMap<String, String>>,
}

/// The phase engine. One instance per cache + manifest universe; safe to
/// share across threads by reference.
pub struct Engine {
    store: CacheStore,
    loader: Arc<dyn SpecLoader>,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn Extractor>,
    runner: Arc<dyn ShellRunner>,
    config: EngineConfig,
    platform: String,
    arch: String,
    state: RwLock<EngineState>,
    products: ProductRegistry,
    cancel: Arc<AtomicBool>,
}

impl Engine {
    /// Create an engine over an already-open cache store.
    #[must_use]
    pub fn new(store: CacheStore, loader: Arc<dyn SpecLoader>, config: EngineConfig) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let platform_name = config
            .platform
            .clone()
            .unwrap_or_else(|| platform::os_name().to_string());
        let arch_name = config
            .arch
            .clone()
            .unwrap_or_else(|| platform::arch_name().to_string());
        Self {
            store,
            loader,
            fetcher: Arc::new(DefaultFetcher::default()),
            extractor: Arc::new(DirCopyExtractor),
            runner: Arc::new(NativeRunner::new().with_cancel(Arc::clone(&cancel))),
            config,
            platform: platform_name,
            arch: arch_name,
            state: RwLock::new(EngineState::default()),
            products: ProductRegistry::new(),
            cancel,
        }
    }

    /// Create an engine, opening the cache from the config's root
    /// resolution chain.
    pub fn open(loader: Arc<dyn SpecLoader>, config: EngineConfig) -> Result<Self, GalleyError> {
        let store = CacheStore::open(config.cache_root.as_deref()).map_err(GalleyError::Store)?;
        Ok(Self::new(store, loader, config))
    }

    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn ShellRunner>) -> Self {
        self.runner = runner;
        self
    }

    #[must_use]
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// The cooperative cancel flag. Setting it stops new phase and
    /// subprocess starts; in-flight subprocesses are killed by the native
    /// runner. Partial cache state is left as-is (completeness is attested
    /// solely by sentinels).
    #[must_use]
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Resolve `roots` into a fresh graph, replacing any previous one.
    /// Fatal resolver errors leave the engine without a graph.
    pub fn resolve_graph(&self, roots: Vec<RecipeSpec>) -> Result<(), GalleyError> {
        let resolver = Resolver::new(&*self.loader, &self.store, &*self.fetcher);
        let (graph, products) = resolver.resolve(roots)?;
        let runtimes = (0..graph.len())
            .map(|_| Arc::new(RecipeRuntime::new()))
            .collect();

        let mut st = self.state.write();
        st.graph = graph;
        st.runtimes = runtimes;
        self.products.adopt(products);
        Ok(())
    }

    /// Resolve and bring every root to `completion`. Returns the outcome
    /// of every recipe in the graph.
    pub fn run_full(
        &self,
        roots: Vec<RecipeSpec>,
    ) -> Result<BTreeMap<RecipeKey, RecipeOutcome>, GalleyError> {
        self.resolve_graph(roots)?;
        let targets: Vec<(RecipeId, Phase)> = {
            let st = self.state.read();
            st.graph
                .roots()
                .iter()
                .map(|&id| (id, Phase::Completion))
                .collect()
        };
        self.drive(&targets);
        Ok(self.outcomes())
    }

    /// Bring one resolved recipe (and, transitively, whatever it needs) to
    /// `target`. Fails when the recipe is unknown or ended up `Failed`
    /// (cancellation mid-run reports the recipe as failed with reason
    /// `cancelled`; the cache keeps whatever partial state the sentinels
    /// attest).
    pub fn ensure_recipe_at_phase(
        &self,
        key: &RecipeKey,
        target: Phase,
    ) -> Result<(), GalleyError> {
        let id = {
            let st = self.state.read();
            st.graph.id_of(key).ok_or_else(|| {
                GalleyError::Resolve(ResolveError::NotFound {
                    identity: key.to_string(),
                })
            })?
        };
        self.drive(&[(id, target)]);

        let st = self.state.read();
        if let Some(reason) = st.runtimes[id.index()].failure_reason() {
            return Err(GalleyError::RecipeFailed {
                key: key.to_string(),
                reason,
            });
        }
        Ok(())
    }

    /// Exact-key lookup; returns a snapshot, not a live reference.
    #[must_use]
    pub fn find_exact(&self, key: &RecipeKey) -> Option<RecipeView> {
        let st = self.state.read();
        st.graph.find_exact(key).map(|r| RecipeView {
            key: r.key.clone(),
            identity: r.spec.identity().clone(),
            rtype: r.rtype,
            variant_hash: r.variant_hash.clone(),
            asset_path: r.asset_path.clone(),
            products: r.products_resolved.clone(),
        })
    }

    /// Unique provider of a product name, if any.
    #[must_use]
    pub fn find_product_provider(&self, name: &str) -> Option<RecipeView> {
        let key = self.products.find_provider(name)?;
        self.find_exact(&key)
    }

    /// Every known product with its provider and (if installed) value.
    #[must_use]
    pub fn collect_all_products(&self) -> Vec<ProductInfo> {
        self.products.collect_all()
    }

    /// Outcome of every recipe in the current graph.
    #[must_use]
    pub fn outcomes(&self) -> BTreeMap<RecipeKey, RecipeOutcome> {
        let st = self.state.read();
        st.graph
            .iter()
            .map(|r| {
                let rt = &st.runtimes[r.id.index()];
                let outcome = if let Some(reason) = rt.failure_reason() {
                    RecipeOutcome::Failed { reason }
                } else if demand_met(rt) {
                    RecipeOutcome::Done
                } else if self.cancel.load(Ordering::Relaxed) {
                    RecipeOutcome::Failed {
                        reason: "cancelled".into(),
                    }
                } else {
                    RecipeOutcome::Failed {
                        reason: "incomplete".into(),
                    }
                };
                (r.key.clone(), outcome)
            })
            .collect()
    }

    /// Publish a shell integration hook exporting resolved product paths.
    pub fn export_shell_hook(&self) -> Result<Utf8PathBuf, GalleyError> {
        let mut content = String::from("# generated by galley; do not edit\n");
        for product in self.collect_all_products() {
            let Some(value) = product.value else { continue };
            let var: String = product
                .name
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            content.push_str(&format!("export GALLEY_PRODUCT_{var}=\"{value}\"\n"));
        }
        let ext = if cfg!(windows) { "bat" } else { "sh" };
        Ok(self.store.write_shell_hook(ext, &content)?)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn drive(&self, targets: &[(RecipeId, Phase)]) {
        {
            let st = self.state.read();
            for &(id, phase) in targets {
                propagate_demand(&st.graph, &st.runtimes, id, phase);
            }
        }

        let workers = self.config.workers.unwrap_or_else(num_cpus::get).max(1);
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Shared {
            tx,
            outstanding: AtomicUsize::new(0),
            workers,
        };

        self.scan_and_enqueue(&shared);
        if shared.outstanding.load(Ordering::Acquire) == 0 {
            return;
        }

        debug!(workers, "phase engine starting");
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let rx: Receiver<WorkItem> = rx.clone();
                let shared = &shared;
                scope.spawn(move || self.worker_loop(shared, &rx));
            }
        });
    }

    fn worker_loop(&self, shared: &Shared, rx: &Receiver<WorkItem>) {
        while let Ok(item) = rx.recv() {
            match item {
                WorkItem::Run(id, phase) => {
                    let result = self.execute_phase(id, phase);
                    self.finish_phase(id, phase, result);
                    self.scan_and_enqueue(shared);
                    if shared.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
                        for _ in 0..shared.workers {
                            let _ = shared.tx.send(WorkItem::Shutdown);
                        }
                    }
                }
                WorkItem::Shutdown => break,
            }
        }
    }

    /// Enqueue every claimable ready phase. Claiming is the CAS that keeps
    /// a given recipe's phase on exactly one worker.
    fn scan_and_enqueue(&self, shared: &Shared) {
        let st = self.state.read();
        for id in st.graph.ids() {
            if let Some(phase) = ready_phase(&st, id)
                && st.runtimes[id.index()].states.claim(phase)
            {
                trace!(recipe = %st.graph.recipe(id).key, %phase, "phase ready");
                shared.outstanding.fetch_add(1, Ordering::AcqRel);
                let _ = shared.tx.send(WorkItem::Run(id, phase));
            }
        }
    }

    fn runtime(&self, id: RecipeId) -> Arc<RecipeRuntime> {
        Arc::clone(&self.state.read().runtimes[id.index()])
    }

    fn finish_phase(&self, id: RecipeId, phase: Phase, result: Result<(), PhaseError>) {
        match result {
            Ok(()) => {
                let rt = self.runtime(id);
                // A prerequisite may have failed this recipe while the
                // phase was in flight; a late success must not resurrect it.
                if !rt.failed() {
                    rt.states.mark_done(phase);
                    trace!(phase = %phase, "phase done");
                }
            }
            Err(err) => {
                let reason = err.to_string();
                if !err.is_cancelled() {
                    let key = self.state.read().graph.recipe(id).key.clone();
                    warn!(recipe = %key, phase = %phase, "phase failed: {reason}");
                }
                self.fail_recipe(id, &reason);
            }
        }
    }

    /// Mark a recipe failed and propagate to every transitive dependent.
    fn fail_recipe(&self, id: RecipeId, reason: &str) {
        fn fail_tree(st: &EngineState, id: RecipeId, reason: &str) {
            if !st.runtimes[id.index()].fail(reason) {
                return;
            }
            let recipe = st.graph.recipe(id);
            let wrapped = PhaseError::Prerequisite {
                dep: recipe.key.to_string(),
                reason: reason.to_string(),
            }
            .to_string();
            for &(parent, _) in &recipe.dependents {
                fail_tree(st, parent, &wrapped);
            }
        }
        let st = self.state.read();
        fail_tree(&st, id, reason);
    }

    // ------------------------------------------------------------------
    // Phase execution
    // ------------------------------------------------------------------

    fn execute_phase(&self, id: RecipeId, phase: Phase) -> Result<(), PhaseError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(PhaseError::Cancelled);
        }
        match phase {
            Phase::Fetch => self.exec_fetch(id),
            Phase::Check => self.exec_check(id),
            Phase::Stage | Phase::Build => self.exec_plain(id, phase),
            Phase::Install => self.exec_install(id),
            Phase::Completion => self.exec_completion(id),
        }
    }

    fn snapshot(&self, id: RecipeId) -> (Arc<RecipeSpec>, RecipeKey, RecipeType, String) {
        let st = self.state.read();
        let r = st.graph.recipe(id);
        (
            Arc::clone(&r.spec),
            r.key.clone(),
            r.rtype,
            r.variant_hash.clone(),
        )
    }

    fn exec_fetch(&self, id: RecipeId) -> Result<(), PhaseError> {
        let (spec, key, rtype, variant_hash) = self.snapshot(id);
        let rt = self.runtime(id);

        let entry = self.store.ensure_pkg(
            spec.identity(),
            &self.platform,
            &self.arch,
            &variant_hash,
            &key,
        )?;

        match entry.lock {
            None if rtype == RecipeType::CacheManaged => {
                // Fast path: the published entry short-circuits every
                // phase up to install.
                info!(recipe = %key, "cache hit, skipping to completion");
                {
                    let mut st = self.state.write();
                    st.graph.recipe_mut(id).asset_path = Some(entry.pkg_path.clone());
                }
                self.resolve_products(id, Some(&entry.pkg_path))?;
                for phase in [Phase::Check, Phase::Stage, Phase::Build, Phase::Install] {
                    rt.states.mark_done(phase);
                }
                return Ok(());
            }
            None => {
                // A user-managed recipe found a published entry (the
                // recipe was cache-managed in a prior run). Its truth is
                // external system state: drop the stale entry, sentinels
                // included, and start over as if none existed.
                warn!(recipe = %key, "purging stale published entry for user-managed recipe");
                self.store.purge_pkg(
                    spec.identity(),
                    &self.platform,
                    &self.arch,
                    &variant_hash,
                    &key,
                )?;
                let retry = self.store.ensure_pkg(
                    spec.identity(),
                    &self.platform,
                    &self.arch,
                    &variant_hash,
                    &key,
                )?;
                match retry.lock {
                    Some(handle) => *rt.handle.lock() = Some(handle),
                    None => {
                        return Err(PhaseError::Callback(anyhow::anyhow!(
                            "stale entry for '{key}' was republished while being purged"
                        )));
                    }
                }
            }
            Some(handle) => {
                *rt.handle.lock() = Some(handle);
            }
        }

        let fetch_done = rt
            .handle
            .lock()
            .as_ref()
            .is_some_and(|h| h.fetch_complete());
        if !fetch_done && let Some(cb) = spec.callbacks().fetch.clone() {
            self.run_phase_callback(&cb, id, Phase::Fetch)?;
        }

        self.materialize_children(id)?;

        if let Some(handle) = rt.handle.lock().as_ref() {
            handle.mark_fetch_complete()?;
        }
        Ok(())
    }

    fn exec_check(&self, id: RecipeId) -> Result<(), PhaseError> {
        let (spec, key, _, _) = self.snapshot(id);
        let Some(cb) = spec.callbacks().check.clone() else {
            return Ok(());
        };

        let mut ctx = self.phase_context(id, Phase::Check)?;
        let outcome = cb(&mut ctx).map_err(as_phase_error)?;
        if outcome == crate::types::CheckOutcome::Satisfied {
            info!(recipe = %key, "check satisfied, skipping stage..install");
            let rt = self.runtime(id);
            rt.satisfied.store(true, Ordering::Release);
            if let Some(handle) = rt.handle.lock().take() {
                handle.purge_entry()?;
            }
            for phase in [Phase::Stage, Phase::Build, Phase::Install] {
                rt.states.mark_done(phase);
            }
            self.resolve_products(id, None)?;
        }
        Ok(())
    }

    fn exec_plain(&self, id: RecipeId, phase: Phase) -> Result<(), PhaseError> {
        let (spec, _, _, _) = self.snapshot(id);
        if let Some(cb) = spec.callbacks().for_phase(phase).cloned() {
            self.run_phase_callback(&cb, id, phase)?;
        }
        Ok(())
    }

    fn exec_install(&self, id: RecipeId) -> Result<(), PhaseError> {
        let (spec, _, rtype, _) = self.snapshot(id);
        if rtype == RecipeType::CacheManaged {
            let rt = self.runtime(id);
            if let Some(handle) = rt.handle.lock().as_ref() {
                handle.reset_install_staging()?;
            }
        }
        if let Some(cb) = spec.callbacks().install.clone() {
            self.run_phase_callback(&cb, id, Phase::Install)?;
        }

        match rtype {
            RecipeType::CacheManaged => {
                let rt = self.runtime(id);
                let handle = rt.handle.lock().take().ok_or_else(|| {
                    PhaseError::Callback(anyhow::anyhow!("install ran without a cache handle"))
                })?;
                // Recipes without an install callback publish whatever the
                // staging tree holds (possibly an empty payload).
                handle.install_dir()?;
                handle.mark_install_complete()?;
                let pkg_path = handle.entry_dir().join("install");
                drop(handle);

                {
                    let mut st = self.state.write();
                    st.graph.recipe_mut(id).asset_path = Some(pkg_path.clone());
                }
                self.resolve_products(id, Some(&pkg_path))?;
            }
            RecipeType::UserManaged => {
                self.resolve_products(id, None)?;
            }
            RecipeType::Unknown => {
                return Err(PhaseError::Callback(anyhow::anyhow!(
                    "recipe was never materialized"
                )));
            }
        }
        Ok(())
    }

    fn exec_completion(&self, id: RecipeId) -> Result<(), PhaseError> {
        let (_, key, rtype, _) = self.snapshot(id);
        let rt = self.runtime(id);
        if rtype == RecipeType::UserManaged {
            // User-managed recipes never leave a cached artifact.
            if let Some(handle) = rt.handle.lock().take() {
                handle.purge_entry()?;
            }
        }
        debug!(
            recipe = %key,
            satisfied = rt.satisfied.load(Ordering::Acquire),
            "recipe complete"
        );
        Ok(())
    }

    fn run_phase_callback(
        &self,
        cb: &PhaseCallback,
        id: RecipeId,
        phase: Phase,
    ) -> Result<(), PhaseError> {
        let mut ctx = self.phase_context(id, phase)?;
        cb(&mut ctx).map_err(as_phase_error)
    }

    /// Build the capability-scoped context for one callback. Everything is
    /// snapshotted here so callbacks never touch engine locks.
    fn phase_context(&self, id: RecipeId, phase: Phase) -> Result<PhaseContext, PhaseError> {
        let st = self.state.read();
        let r = st.graph.recipe(id);
        let rt = &st.runtimes[id.index()];

        let handle_guard = rt.handle.lock();
        let handle = handle_guard.as_ref().ok_or_else(|| {
            PhaseError::Callback(anyhow::anyhow!("no cache entry handle for callback"))
        })?;
        let fetch_dir = handle.fetch_dir()?;
        let stage_dir = handle.stage_dir()?;
        let install_dir = handle.install_dir()?;
        let tmp_dir = handle.tmp_dir()?;

        let mut declared = Vec::with_capacity(r.deps.len());
        for edge in &r.deps {
            let target = st.graph.recipe(edge.target);
            match &r.spec.dependencies()[edge.dep_index] {
                DepSpec::Product { name, .. } => declared.push(Declared::Product {
                    name: name.clone(),
                    value: self.products.value_from(name, &target.key),
                }),
                _ => declared.push(Declared::Recipe {
                    identity: target.spec.identity().clone(),
                    asset: target.asset_path.clone(),
                }),
            }
        }

        let shell = r
            .spec
            .callbacks()
            .default_shell
            .or(self.config.default_shell)
            .unwrap_or_else(ShellKind::platform_default);

        Ok(PhaseContext {
            key: r.key.clone(),
            identity: r.spec.identity().clone(),
            phase,
            source: r.spec.source().clone(),
            fetch_dir,
            stage_dir,
            install_dir,
            tmp_dir,
            declared,
            env: self.config.env.clone(),
            shell,
            timeout: self.config.subprocess_timeout,
            fetcher: Arc::clone(&self.fetcher),
            extractor: Arc::clone(&self.extractor),
            runner: Arc::clone(&self.runner),
            cancel: Arc::clone(&self.cancel),
        })
    }

    /// Run the custom-fetch callbacks of this recipe's still-pending
    /// children, publish their bodies, and splice the loaded specs into
    /// the running graph.
    fn materialize_children(&self, id: RecipeId) -> Result<(), PhaseError> {
        let pending: Vec<(RecipeId, Identity, crate::spec::FetchBodyCallback)> = {
            let st = self.state.read();
            let r = st.graph.recipe(id);
            r.deps
                .iter()
                .filter(|edge| {
                    edge.kind == DepKind::CustomFetch
                        && st.graph.recipe(edge.target).pending_custom_fetch
                })
                .filter_map(|edge| match &r.spec.dependencies()[edge.dep_index] {
                    DepSpec::CustomFetch {
                        identity, inline, ..
                    } => Some((edge.target, identity.clone(), inline.fetch.clone())),
                    _ => None,
                })
                .collect()
        };

        for (child_id, child_identity, fetch_cb) in pending {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(PhaseError::Cancelled);
            }
            let tmp_dir = {
                let rt = self.runtime(id);
                let guard = rt.handle.lock();
                let handle = guard.as_ref().ok_or_else(|| {
                    PhaseError::Callback(anyhow::anyhow!("custom fetch without a cache handle"))
                })?;
                handle.tmp_dir()?
            };

            let mut ctx = CustomFetchContext {
                child: child_identity.clone(),
                tmp_dir,
                store: self.store.clone(),
                fetcher: Arc::clone(&self.fetcher),
                cancel: Arc::clone(&self.cancel),
                committed: None,
            };
            fetch_cb(&mut ctx).map_err(as_phase_error)?;

            let source_path = ctx
                .committed
                .clone()
                .or_else(|| self.store.spec_source_if_complete(&child_identity))
                .ok_or_else(|| {
                    PhaseError::Callback(anyhow::anyhow!(
                        "custom-fetch callback did not commit a body for '{child_identity}'"
                    ))
                })?;

            let loaded = self
                .loader
                .load(&child_identity, &source_path)
                .map_err(|e| {
                    PhaseError::Resolve(Box::new(ResolveError::Loader {
                        identity: child_identity.to_string(),
                        source: e,
                    }))
                })?;

            {
                let mut st = self.state.write();
                let st = &mut *st;
                let resolver = Resolver::new(&*self.loader, &self.store, &*self.fetcher);
                resolver
                    .splice(&mut st.graph, &self.products, child_id, loaded)
                    .map_err(|e| PhaseError::Resolve(Box::new(e)))?;
                while st.runtimes.len() < st.graph.len() {
                    st.runtimes.push(Arc::new(RecipeRuntime::new()));
                }
                // The new subtree inherits the demands already placed on
                // the graph.
                let demanded: Vec<(RecipeId, Phase)> = st
                    .graph
                    .ids()
                    .filter_map(|i| st.runtimes[i.index()].demand().map(|d| (i, d)))
                    .collect();
                for (i, d) in demanded {
                    propagate_demand(&st.graph, &st.runtimes, i, d);
                }
            }
            info!(child = %child_identity, "custom-fetch child materialized");
        }
        Ok(())
    }

    /// Evaluate and record the recipe's product table after install.
    /// `install_dir` is `Some` exactly for cache-managed recipes; their
    /// values resolve to paths inside the published payload, while
    /// user-managed values stay raw.
    fn resolve_products(
        &self,
        id: RecipeId,
        install_dir: Option<&Utf8Path>,
    ) -> Result<(), PhaseError> {
        let (spec, key, _, _) = self.snapshot(id);

        let table: BTreeMap<String, String> = match spec.products() {
            crate::spec::ProductsDecl::None => BTreeMap::new(),
            crate::spec::ProductsDecl::Static(map) => map.clone(),
            crate::spec::ProductsDecl::Dynamic(cb) => {
                let query = ProductQuery {
                    key: &key,
                    install_dir,
                };
                cb(&query).map_err(as_phase_error)?
            }
        };

        let mut resolved = BTreeMap::new();
        for (name, raw) in table {
            let value = match install_dir {
                Some(dir) => dir.join(&raw).to_string(),
                None => raw,
            };
            self.products.record_value(&name, &key, value.clone());
            resolved.insert(name, value);
        }

        let mut st = self.state.write();
        st.graph.recipe_mut(id).products_resolved = Some(resolved);
        Ok(())
    }
}

/// Convert a callback error, recovering typed phase errors raised through
/// the capability context.
fn as_phase_error(err: anyhow::Error) -> PhaseError {
    match err.downcast::<PhaseError>() {
        Ok(phase_err) => phase_err,
        Err(other) => PhaseError::Callback(other),
    }
}

fn demand_met(rt: &RecipeRuntime) -> bool {
    match rt.demand() {
        None => true,
        Some(d) => rt.states.done_through().is_some_and(|p| p >= d),
    }
}

/// Raise `id`'s demand to `phase` and push it down through every edge that
/// must be satisfied by then. Monotonic, so weak cycles terminate.
fn propagate_demand(
    graph: &Graph,
    runtimes: &[Arc<RecipeRuntime>],
    id: RecipeId,
    phase: Phase,
) {
    if !runtimes[id.index()].raise_demand(phase) {
        return;
    }
    for edge in &graph.recipe(id).deps {
        if edge.needed_by <= phase {
            propagate_demand(graph, runtimes, edge.target, phase);
        }
    }
}

/// The next runnable phase of `id`, or `None` when it is blocked, done,
/// failed, or not demanded that far.
fn ready_phase(st: &EngineState, id: RecipeId) -> Option<Phase> {
    let rt = &st.runtimes[id.index()];
    if rt.failed() {
        return None;
    }
    let recipe = st.graph.recipe(id);
    if recipe.pending_custom_fetch {
        return None;
    }

    let next = match rt.states.done_through() {
        None => Phase::Fetch,
        Some(done) => done.next()?,
    };
    match rt.demand() {
        Some(demand) if demand >= next => {}
        _ => return None,
    }

    for edge in &recipe.deps {
        if edge.needed_by <= next {
            let dep = &st.runtimes[edge.target.index()];
            if !dep.states.done_through().is_some_and(|p| p >= next) {
                return None;
            }
        }
    }
    Some(next)
}

/// Render an outcome map the way status lines are logged: counts first,
/// then each failure on its own line.
#[must_use]
pub fn summarize(outcomes: &BTreeMap<RecipeKey, RecipeOutcome>) -> String {
    let done = outcomes.values().filter(|o| o.is_done()).count();
    let failed = outcomes.len() - done;
    let mut out = format!("{done} done, {failed} failed");
    for (key, outcome) in outcomes {
        if let RecipeOutcome::Failed { reason } = outcome {
            out.push_str(&format!("\n  {key}: {reason}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_counts_and_lists_failures() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            crate::identity::format_key(&Identity::parse("a@1").unwrap(), ""),
            RecipeOutcome::Done,
        );
        outcomes.insert(
            crate::identity::format_key(&Identity::parse("b@1").unwrap(), ""),
            RecipeOutcome::Failed {
                reason: "subprocess exited with code 2".into(),
            },
        );

        let summary = summarize(&outcomes);
        assert!(summary.starts_with("1 done, 1 failed"));
        assert!(summary.contains("b@1: subprocess exited with code 2"));
    }
}
