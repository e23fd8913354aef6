//! The resolved recipe graph.
//!
//! One [`Recipe`] node per `(identity, serialized_options)` key. All
//! cross-references are index-based ([`RecipeId`]), which keeps the graph
//! cycle-capable (weak edges may legally close cycles) without lifetime
//! acrobatics. Specs themselves are owned by the embedded [`SpecPool`].

use crate::identity::RecipeKey;
use crate::spec::{RecipeSpec, SpecPool};
use crate::types::{Phase, RecipeType};
use camino::Utf8PathBuf;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Stable index of one recipe node within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipeId(pub(crate) u32);

impl RecipeId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which dependency variant produced an edge. Weak edges never participate
/// in strong-cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Strong,
    RefOnly,
    Weak,
    Product,
    CustomFetch,
}

impl DepKind {
    /// Edges that make a cycle fatal.
    #[must_use]
    pub const fn is_strong_edge(self) -> bool {
        matches!(self, Self::Strong | Self::CustomFetch)
    }
}

/// One resolved dependency edge.
#[derive(Debug, Clone)]
pub struct ResolvedDep {
    /// Index into the parent spec's declared dependency list.
    pub dep_index: usize,
    /// The recipe this dependency resolved to.
    pub target: RecipeId,
    /// Parent phase by which the target must be satisfied.
    pub needed_by: Phase,
    pub kind: DepKind,
}

/// A resolved, mutable graph node.
#[derive(Debug)]
pub struct Recipe {
    pub id: RecipeId,
    pub spec: Arc<RecipeSpec>,
    pub key: RecipeKey,
    pub rtype: RecipeType,
    /// Resolved edges, in declaration order.
    pub deps: Vec<ResolvedDep>,
    /// Reverse edges: recipes waiting on this one, with the phase they
    /// need it by.
    pub dependents: Vec<(RecipeId, Phase)>,
    /// Digests of weak-fallback recipes instantiated for this node; sorted,
    /// feeds the variant hash.
    pub weak_fallback_digests: Vec<String>,
    /// 16-hex-char cache-entry discriminator; empty until resolution
    /// finishes.
    pub variant_hash: String,
    /// Installed payload location, populated after install for
    /// cache-managed recipes.
    pub asset_path: Option<Utf8PathBuf>,
    /// Evaluated product table, populated after install.
    pub products_resolved: Option<BTreeMap<String, String>>,
    /// True while this node is a custom-fetch child whose real spec has
    /// not been materialized yet.
    pub pending_custom_fetch: bool,
}

impl Recipe {
    /// The resolved edge for a declared dependency index, if resolution
    /// produced one.
    #[must_use]
    pub fn edge_for(&self, dep_index: usize) -> Option<&ResolvedDep> {
        self.deps.iter().find(|d| d.dep_index == dep_index)
    }
}

/// The validated dependency graph of one engine run.
#[derive(Debug, Default)]
pub struct Graph {
    recipes: Vec<Recipe>,
    by_key: HashMap<RecipeKey, RecipeId>,
    roots: Vec<RecipeId>,
    pool: SpecPool,
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `spec` and return its node, creating one if absent.
    /// The boolean is true when a new node was created.
    pub fn add_spec(&mut self, spec: RecipeSpec, pending_custom_fetch: bool) -> (RecipeId, bool) {
        let (_, shared) = self.pool.intern(spec);
        let key = shared.key().clone();
        if let Some(&id) = self.by_key.get(&key) {
            return (id, false);
        }

        let id = RecipeId(u32::try_from(self.recipes.len()).expect("graph overflow"));
        let rtype = if pending_custom_fetch {
            RecipeType::Unknown
        } else if shared.is_user_managed() {
            RecipeType::UserManaged
        } else {
            RecipeType::CacheManaged
        };
        self.recipes.push(Recipe {
            id,
            spec: shared,
            key: key.clone(),
            rtype,
            deps: Vec::new(),
            dependents: Vec::new(),
            weak_fallback_digests: Vec::new(),
            variant_hash: String::new(),
            asset_path: None,
            products_resolved: None,
            pending_custom_fetch,
        });
        self.by_key.insert(key, id);
        (id, true)
    }

    /// Swap in the materialized spec of a custom-fetch child.
    pub fn materialize(&mut self, id: RecipeId, spec: RecipeSpec) {
        let shared = self.pool.replace(spec);
        let recipe = &mut self.recipes[id.index()];
        recipe.rtype = if shared.is_user_managed() {
            RecipeType::UserManaged
        } else {
            RecipeType::CacheManaged
        };
        recipe.spec = shared;
        recipe.pending_custom_fetch = false;
    }

    /// Drop every resolved edge of `id` (and the matching reverse edges).
    /// Used when a custom-fetch child is materialized: its real dependency
    /// list replaces the inline one wholesale.
    pub fn reset_deps(&mut self, id: RecipeId) {
        let old = std::mem::take(&mut self.recipes[id.index()].deps);
        for edge in old {
            self.recipes[edge.target.index()]
                .dependents
                .retain(|(parent, _)| *parent != id);
        }
    }

    /// Record a resolved edge and its reverse edge.
    pub fn add_edge(
        &mut self,
        parent: RecipeId,
        dep_index: usize,
        target: RecipeId,
        needed_by: Phase,
        kind: DepKind,
    ) {
        self.recipes[parent.index()].deps.push(ResolvedDep {
            dep_index,
            target,
            needed_by,
            kind,
        });
        self.recipes[target.index()]
            .dependents
            .push((parent, needed_by));
    }

    pub fn add_root(&mut self, id: RecipeId) {
        if !self.roots.contains(&id) {
            self.roots.push(id);
        }
    }

    #[must_use]
    pub fn roots(&self) -> &[RecipeId] {
        &self.roots
    }

    #[must_use]
    pub fn recipe(&self, id: RecipeId) -> &Recipe {
        &self.recipes[id.index()]
    }

    pub fn recipe_mut(&mut self, id: RecipeId) -> &mut Recipe {
        &mut self.recipes[id.index()]
    }

    /// Exact-key lookup.
    #[must_use]
    pub fn find_exact(&self, key: &RecipeKey) -> Option<&Recipe> {
        self.by_key.get(key).map(|&id| self.recipe(id))
    }

    #[must_use]
    pub fn id_of(&self, key: &RecipeKey) -> Option<RecipeId> {
        self.by_key.get(key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
        self.recipes.iter()
    }

    /// All node ids, in insertion order (roots first, then discovery
    /// order, which is the deterministic traversal order used for cache
    /// entry access).
    pub fn ids(&self) -> impl Iterator<Item = RecipeId> + use<> {
        (0..self.recipes.len() as u32).map(RecipeId)
    }
}
