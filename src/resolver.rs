//! Multi-pass graph resolver.
//!
//! Resolution runs three passes to a fixed point:
//!
//! - **strong closure** — BFS from the roots over `Strong`, pinned
//!   `Product`, and `CustomFetch` dependencies, loading specs through the
//!   external loader as they are discovered;
//! - **reference resolution** — `RefOnly`, `Weak`, and unpinned `Product`
//!   dependencies are matched against the current graph; ambiguity is
//!   fatal, absence leaves the entry for the next pass;
//! - **weak expansion** — once strong closure and reference resolution
//!   stop making progress, still-unresolved weak dependencies instantiate
//!   their fallbacks, and resolution returns to the strong pass.
//!
//! A pass budget guards against pathological fallback-of-fallback chains.
//! After the fixed point, strong-edge cycles are rejected and every node
//! gets its variant hash. All errors are fatal: no partial graph escapes.

use crate::error::{ResolveError, StoreError};
use crate::fetch::Fetcher;
use crate::graph::{DepKind, Graph, RecipeId};
use crate::identity::{Identity, format_key, key_digest, variant_hash};
use crate::loader::SpecLoader;
use crate::options::serialize_options;
use crate::products::ProductRegistry;
use crate::spec::{DepSpec, FetchSource, ProductTarget, RecipeSpec, StrongDep};
use crate::store::CacheStore;
use crate::types::Phase;
use camino::Utf8PathBuf;
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use tracing::{debug, trace};

/// Pass budget; exceeding it reports divergence instead of looping.
const MAX_PASSES: u32 = 16;

/// Graph resolver. Borrows the external collaborators for one run.
pub struct Resolver<'a> {
    loader: &'a dyn SpecLoader,
    store: &'a CacheStore,
    fetcher: &'a dyn Fetcher,
}

impl<'a> Resolver<'a> {
    #[must_use]
    pub const fn new(
        loader: &'a dyn SpecLoader,
        store: &'a CacheStore,
        fetcher: &'a dyn Fetcher,
    ) -> Self {
        Self {
            loader,
            store,
            fetcher,
        }
    }

    /// Resolve a set of root specs into a validated graph plus the static
    /// product index.
    pub fn resolve(
        &self,
        roots: Vec<RecipeSpec>,
    ) -> Result<(Graph, ProductRegistry), ResolveError> {
        let mut graph = Graph::new();
        let products = ProductRegistry::new();
        let mut worklist = VecDeque::new();

        for spec in roots {
            validate_spec(&spec)?;
            let (id, created) = graph.add_spec(spec, false);
            graph.add_root(id);
            if created {
                register_static_products(&graph, &products, id);
                worklist.push_back(id);
            }
        }

        let mut unresolved = Vec::new();
        self.run_to_fixed_point(&mut graph, &products, &mut worklist, &mut unresolved)?;
        check_cycles(&graph)?;
        assign_variant_hashes(&mut graph);
        debug!(recipes = graph.len(), "graph resolved");
        Ok((graph, products))
    }

    /// Graft the materialized spec of a custom-fetch child into a running
    /// graph and resolve everything it brings along. This is the only
    /// operation by which the graph grows after execution has begun.
    pub fn splice(
        &self,
        graph: &mut Graph,
        products: &ProductRegistry,
        child: RecipeId,
        spec: RecipeSpec,
    ) -> Result<(), ResolveError> {
        validate_spec(&spec)?;
        {
            let placeholder = graph.recipe(child);
            if spec.identity() != placeholder.spec.identity() {
                return Err(ResolveError::BadManifest {
                    identity: placeholder.spec.identity().to_string(),
                    reason: format!(
                        "custom-fetch body declares identity '{}'",
                        spec.identity()
                    ),
                });
            }
            if spec.key() != &placeholder.key {
                return Err(ResolveError::BadManifest {
                    identity: spec.identity().to_string(),
                    reason: "custom-fetch bodies must not add options".into(),
                });
            }
        }

        // The real dependency list replaces the inline one wholesale.
        graph.reset_deps(child);
        graph.materialize(child, spec);
        register_static_products(graph, products, child);

        let mut worklist = VecDeque::from([child]);
        let mut unresolved = Vec::new();
        self.run_to_fixed_point(graph, products, &mut worklist, &mut unresolved)?;
        check_cycles(graph)?;
        assign_variant_hashes(graph);
        Ok(())
    }

    fn run_to_fixed_point(
        &self,
        graph: &mut Graph,
        products: &ProductRegistry,
        worklist: &mut VecDeque<RecipeId>,
        unresolved: &mut Vec<(RecipeId, usize)>,
    ) -> Result<(), ResolveError> {
        let mut passes = 0;
        loop {
            passes += 1;
            if passes > MAX_PASSES {
                return Err(ResolveError::Diverged {
                    iterations: MAX_PASSES,
                });
            }

            let mut changed = self.pass_strong(graph, products, worklist, unresolved)?;
            changed |= pass_refs(graph, products, unresolved)?;
            if !changed {
                // Only fall back once strong closure and reference
                // resolution have both stalled: a target added later in
                // the same fixed point must win over a fallback.
                changed = self.pass_weak_expand(graph, products, worklist, unresolved)?;
            }
            if !changed {
                break;
            }
        }

        if let Some(&(id, dep_index)) = unresolved.first() {
            let recipe = graph.recipe(id);
            let dep = &recipe.spec.dependencies()[dep_index];
            return Err(ResolveError::UnresolvedDependency {
                pattern: dep.describe(),
                wanted_by: recipe.key.to_string(),
            });
        }
        Ok(())
    }

    /// Pass A: strong closure over `Strong`, pinned `Product`, and
    /// `CustomFetch` edges.
    fn pass_strong(
        &self,
        graph: &mut Graph,
        products: &ProductRegistry,
        worklist: &mut VecDeque<RecipeId>,
        unresolved: &mut Vec<(RecipeId, usize)>,
    ) -> Result<bool, ResolveError> {
        let mut changed = false;
        while let Some(id) = worklist.pop_front() {
            changed = true;
            let spec = std::sync::Arc::clone(&graph.recipe(id).spec);
            for (dep_index, dep) in spec.dependencies().iter().enumerate() {
                trace!(recipe = %spec.identity(), dep = %dep.describe(), "resolving dependency");
                match dep {
                    DepSpec::Strong(strong) => {
                        let child =
                            self.ensure_strong_node(graph, products, worklist, strong)?;
                        graph.add_edge(
                            id,
                            dep_index,
                            child,
                            dep.effective_needed_by(),
                            DepKind::Strong,
                        );
                    }
                    DepSpec::Product {
                        target: Some(ProductTarget::Strong(pinned)),
                        ..
                    } => {
                        let child =
                            self.ensure_strong_node(graph, products, worklist, pinned)?;
                        graph.add_edge(
                            id,
                            dep_index,
                            child,
                            dep.effective_needed_by(),
                            DepKind::Product,
                        );
                    }
                    DepSpec::CustomFetch {
                        identity, inline, ..
                    } => {
                        let child = self.ensure_custom_fetch_node(
                            graph, products, worklist, identity, inline,
                        )?;
                        graph.add_edge(
                            id,
                            dep_index,
                            child,
                            dep.effective_needed_by(),
                            DepKind::CustomFetch,
                        );
                    }
                    DepSpec::RefOnly { .. } | DepSpec::Weak { .. } | DepSpec::Product { .. } => {
                        unresolved.push((id, dep_index));
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Pass C: instantiate fallbacks of still-unresolved weak deps.
    fn pass_weak_expand(
        &self,
        graph: &mut Graph,
        products: &ProductRegistry,
        worklist: &mut VecDeque<RecipeId>,
        unresolved: &mut Vec<(RecipeId, usize)>,
    ) -> Result<bool, ResolveError> {
        let mut changed = false;
        let mut still = Vec::new();
        let entries = std::mem::take(unresolved);

        for (id, dep_index) in entries {
            let dep = graph.recipe(id).spec.dependencies()[dep_index].clone();
            let (fallback, kind) = match &dep {
                DepSpec::Weak { fallback, .. } => (fallback.clone(), DepKind::Weak),
                DepSpec::Product {
                    weak_fallback: Some(fallback),
                    ..
                } => (fallback.clone(), DepKind::Product),
                _ => {
                    still.push((id, dep_index));
                    continue;
                }
            };

            let child = self.ensure_strong_node(graph, products, worklist, &fallback)?;
            graph.add_edge(id, dep_index, child, dep.effective_needed_by(), kind);
            let digest = key_digest(&graph.recipe(child).key);
            debug!(
                recipe = %graph.recipe(id).key,
                fallback = %graph.recipe(child).key,
                "weak dependency fell back"
            );
            graph.recipe_mut(id).weak_fallback_digests.push(digest);
            changed = true;
        }

        *unresolved = still;
        Ok(changed)
    }

    /// Find-or-instantiate the node a strong dependency names.
    fn ensure_strong_node(
        &self,
        graph: &mut Graph,
        products: &ProductRegistry,
        worklist: &mut VecDeque<RecipeId>,
        strong: &StrongDep,
    ) -> Result<RecipeId, ResolveError> {
        let declared_key = format_key(&strong.identity, &serialize_options(&strong.options)?);
        if let Some(id) = graph.id_of(&declared_key) {
            return Ok(id);
        }

        let source_path = self.spec_source_path(&strong.identity, &strong.source)?;
        let loaded = self
            .loader
            .load(&strong.identity, &source_path)
            .map_err(|e| ResolveError::Loader {
                identity: strong.identity.to_string(),
                source: e,
            })?;
        if loaded.identity() != &strong.identity {
            return Err(ResolveError::BadManifest {
                identity: strong.identity.to_string(),
                reason: format!("loaded spec declares identity '{}'", loaded.identity()),
            });
        }
        let spec = if strong.options.is_empty() {
            loaded
        } else {
            loaded.with_options(&strong.options)?
        };
        validate_spec(&spec)?;

        let (id, created) = graph.add_spec(spec, false);
        if created {
            register_static_products(graph, products, id);
            worklist.push_back(id);
        }
        Ok(id)
    }

    /// Find-or-create the node of a custom-fetch child. When the spec
    /// cache already holds a committed body (a previous run materialized
    /// it), the child is loaded like any other spec; otherwise a
    /// placeholder carrying the inline dependency list is created and the
    /// body is produced during the parent's fetch phase.
    fn ensure_custom_fetch_node(
        &self,
        graph: &mut Graph,
        products: &ProductRegistry,
        worklist: &mut VecDeque<RecipeId>,
        identity: &Identity,
        inline: &crate::spec::InlineBody,
    ) -> Result<RecipeId, ResolveError> {
        let key = format_key(identity, "");
        if let Some(id) = graph.id_of(&key) {
            return Ok(id);
        }

        if let Some(source_path) = self.store.spec_source_if_complete(identity) {
            let loaded = self
                .loader
                .load(identity, &source_path)
                .map_err(|e| ResolveError::Loader {
                    identity: identity.to_string(),
                    source: e,
                })?;
            if loaded.identity() != identity {
                return Err(ResolveError::BadManifest {
                    identity: identity.to_string(),
                    reason: format!("loaded spec declares identity '{}'", loaded.identity()),
                });
            }
            validate_spec(&loaded)?;
            let (id, created) = graph.add_spec(loaded, false);
            if created {
                register_static_products(graph, products, id);
                worklist.push_back(id);
            }
            return Ok(id);
        }

        let mut builder = RecipeSpec::builder(identity.clone()).source(FetchSource::Inline);
        for dep in &inline.dependencies {
            builder = builder.dependency(dep.clone());
        }
        let placeholder = builder.build()?;
        validate_spec(&placeholder)?;
        let (id, created) = graph.add_spec(placeholder, true);
        if created {
            worklist.push_back(id);
        }
        Ok(id)
    }

    /// Where the canonical recipe body for `identity` lives, fetching it
    /// into the spec cache when the source is remote.
    fn spec_source_path(
        &self,
        identity: &Identity,
        source: &FetchSource,
    ) -> Result<Utf8PathBuf, ResolveError> {
        match source {
            FetchSource::Local(path) => Ok(path.clone()),
            FetchSource::Remote { digest, .. } => {
                if let Some(path) = self.store.spec_source_if_complete(identity) {
                    return Ok(path);
                }
                let entry = self.store.ensure_spec(identity)?;
                let Some(handle) = entry.lock.as_ref() else {
                    // Committed while we waited for the lock.
                    return Ok(entry.source_path);
                };
                let fetched = self
                    .fetcher
                    .fetch_one(source, &entry.dir, digest.as_deref())
                    .map_err(|e| ResolveError::Loader {
                        identity: identity.to_string(),
                        source: anyhow::Error::new(e),
                    })?;
                let body = fs::read(fetched.path.as_std_path()).map_err(|e| {
                    ResolveError::Store(StoreError::Io {
                        path: fetched.path.to_string(),
                        source: e,
                    })
                })?;
                handle.commit_source(&body)?;
                let _ = fs::remove_file(fetched.path.as_std_path());
                Ok(entry.source_path)
            }
            FetchSource::Inline => {
                self.store
                    .spec_source_if_complete(identity)
                    .ok_or_else(|| ResolveError::BadManifest {
                        identity: identity.to_string(),
                        reason: "inline source has no committed body".into(),
                    })
            }
        }
    }
}

/// Pass B: match `RefOnly`, `Weak`, pattern-pinned `Product`, and unpinned
/// `Product` deps against the current graph. Zero matches leaves the entry
/// unresolved for a later pass; two or more distinct keys is fatal.
fn pass_refs(
    graph: &mut Graph,
    products: &ProductRegistry,
    unresolved: &mut Vec<(RecipeId, usize)>,
) -> Result<bool, ResolveError> {
    let mut changed = false;
    let mut still = Vec::new();
    let entries = std::mem::take(unresolved);

    for (id, dep_index) in entries {
        let dep = graph.recipe(id).spec.dependencies()[dep_index].clone();
        match &dep {
            DepSpec::RefOnly { pattern, .. }
            | DepSpec::Weak { target: pattern, .. }
            | DepSpec::Product {
                target: Some(ProductTarget::RefOnly(pattern)),
                ..
            } => {
                let kind = match &dep {
                    DepSpec::RefOnly { .. } => DepKind::RefOnly,
                    DepSpec::Weak { .. } => DepKind::Weak,
                    _ => DepKind::Product,
                };
                let matches = find_matches(graph, pattern);
                match matches.as_slice() {
                    [] => still.push((id, dep_index)),
                    [single] => {
                        graph.add_edge(id, dep_index, *single, dep.effective_needed_by(), kind);
                        changed = true;
                    }
                    many => {
                        let mut candidates: Vec<String> = many
                            .iter()
                            .map(|&m| graph.recipe(m).key.to_string())
                            .collect();
                        candidates.sort();
                        return Err(ResolveError::AmbiguousDependency {
                            pattern: pattern.to_string(),
                            wanted_by: graph.recipe(id).key.to_string(),
                            candidates,
                        });
                    }
                }
            }
            DepSpec::Product {
                name, target: None, ..
            } => {
                let providers = products.providers(name);
                match providers.as_slice() {
                    [] => still.push((id, dep_index)),
                    [single] => {
                        let target = graph
                            .id_of(single)
                            .expect("registered provider must be in the graph");
                        graph.add_edge(
                            id,
                            dep_index,
                            target,
                            dep.effective_needed_by(),
                            DepKind::Product,
                        );
                        changed = true;
                    }
                    many => {
                        let mut names: Vec<String> =
                            many.iter().map(ToString::to_string).collect();
                        names.sort();
                        return Err(ResolveError::AmbiguousProduct {
                            name: name.clone(),
                            providers: names,
                        });
                    }
                }
            }
            // Strong-shaped deps never land in the unresolved list.
            DepSpec::Strong(_)
            | DepSpec::Product {
                target: Some(ProductTarget::Strong(_)),
                ..
            }
            | DepSpec::CustomFetch { .. } => unreachable!("strong deps resolve in pass A"),
        }
    }

    *unresolved = still;
    Ok(changed)
}

/// All nodes whose identity matches `pattern`, in insertion order.
fn find_matches(graph: &Graph, pattern: &Identity) -> Vec<RecipeId> {
    graph
        .iter()
        .filter(|r| r.spec.identity().matches(pattern))
        .map(|r| r.id)
        .collect()
}

fn register_static_products(graph: &Graph, products: &ProductRegistry, id: RecipeId) {
    let recipe = graph.recipe(id);
    for name in recipe.spec.products().static_names() {
        products.register_provider(name, &recipe.key);
    }
}

/// Reject manifest encodings the spec tables forbid: ref-only and product
/// dependencies are needed by `check` and an explicit different value is a
/// legacy-manifest bug we refuse to guess around.
fn validate_spec(spec: &RecipeSpec) -> Result<(), ResolveError> {
    for dep in spec.dependencies() {
        match dep {
            DepSpec::RefOnly {
                needed_by: Some(p),
                pattern,
            } if *p != Phase::Check => {
                return Err(ResolveError::BadManifest {
                    identity: spec.identity().to_string(),
                    reason: format!(
                        "ref-only dependency '{pattern}' must be needed by 'check', got '{p}'"
                    ),
                });
            }
            DepSpec::Product {
                needed_by: Some(p),
                name,
                ..
            } if *p != Phase::Check => {
                return Err(ResolveError::BadManifest {
                    identity: spec.identity().to_string(),
                    reason: format!(
                        "product dependency '{name}' must be needed by 'check', got '{p}'"
                    ),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Depth-first strong-edge cycle check. Weak and ref edges may close
/// cycles; `Strong` and `CustomFetch` edges may not.
fn check_cycles(graph: &Graph) -> Result<(), ResolveError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(
        graph: &Graph,
        id: RecipeId,
        marks: &mut [Mark],
        stack: &mut Vec<RecipeId>,
    ) -> Result<(), ResolveError> {
        marks[id.index()] = Mark::Grey;
        stack.push(id);
        for edge in &graph.recipe(id).deps {
            if !edge.kind.is_strong_edge() {
                continue;
            }
            match marks[edge.target.index()] {
                Mark::Grey => {
                    let start = stack
                        .iter()
                        .position(|&s| s == edge.target)
                        .unwrap_or_default();
                    let mut chain: Vec<String> = stack[start..]
                        .iter()
                        .map(|&s| graph.recipe(s).spec.identity().to_string())
                        .collect();
                    chain.push(graph.recipe(edge.target).spec.identity().to_string());
                    return Err(ResolveError::Cycle { chain });
                }
                Mark::White => visit(graph, edge.target, marks, stack)?,
                Mark::Black => {}
            }
        }
        stack.pop();
        marks[id.index()] = Mark::Black;
        Ok(())
    }

    let mut marks = vec![Mark::White; graph.len()];
    let mut stack = Vec::new();
    for id in graph.ids() {
        if marks[id.index()] == Mark::White {
            visit(graph, id, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

/// Compute every node's variant hash from the transitive set of weak
/// fallback digests reachable through its dependencies. Nodes that already
/// carry a hash keep it: entries of recipes mid-execution must stay stable
/// when a custom-fetch splice grows the graph.
fn assign_variant_hashes(graph: &mut Graph) {
    fn collect(
        graph: &Graph,
        id: RecipeId,
        memo: &mut [Option<BTreeSet<String>>],
        on_stack: &mut [bool],
    ) -> BTreeSet<String> {
        if let Some(set) = &memo[id.index()] {
            return set.clone();
        }
        if on_stack[id.index()] {
            // Weak back-edge; contributes nothing new on this path.
            return BTreeSet::new();
        }
        on_stack[id.index()] = true;
        let recipe = graph.recipe(id);
        let mut set: BTreeSet<String> = recipe.weak_fallback_digests.iter().cloned().collect();
        for edge in &recipe.deps {
            set.extend(collect(graph, edge.target, memo, on_stack));
        }
        on_stack[id.index()] = false;
        memo[id.index()] = Some(set.clone());
        set
    }

    let n = graph.len();
    let mut memo: Vec<Option<BTreeSet<String>>> = vec![None; n];
    let mut on_stack = vec![false; n];
    let ids: Vec<RecipeId> = graph.ids().collect();

    for &id in &ids {
        collect(graph, id, &mut memo, &mut on_stack);
    }
    for &id in &ids {
        let digests: Vec<String> = memo[id.index()]
            .as_ref()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let recipe = graph.recipe_mut(id);
        recipe.weak_fallback_digests.sort_unstable();
        if recipe.variant_hash.is_empty() {
            recipe.variant_hash = variant_hash(&recipe.key, &digests);
        }
    }
}
