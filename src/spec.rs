//! Recipe specifications and the interned spec pool.
//!
//! Specs are immutable declarative records produced by the external
//! manifest evaluator. The engine never evaluates manifests itself; user
//! callbacks arrive as opaque handles and are treated as external
//! computation that may fail. The pool interns specs by key: pointer
//! equality of the shared handles implies the same spec record.

use crate::engine::context::{CustomFetchContext, PhaseContext, ProductQuery};
use crate::error::OptionError;
use crate::identity::{Identity, RecipeKey, format_key};
use crate::options::{OptionTable, OptionValue, serialize_options};
use crate::runner::ShellKind;
use crate::types::{CheckOutcome, Phase};
use camino::Utf8PathBuf;
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Callback run for one phase of one recipe.
pub type PhaseCallback = Arc<dyn Fn(&mut PhaseContext) -> anyhow::Result<()> + Send + Sync>;

/// Callback probing external system state for user-managed recipes.
pub type CheckCallback =
    Arc<dyn Fn(&mut PhaseContext) -> anyhow::Result<CheckOutcome> + Send + Sync>;

/// Callback materializing the recipe body of a custom-fetch dependency.
pub type FetchBodyCallback =
    Arc<dyn Fn(&mut CustomFetchContext) -> anyhow::Result<()> + Send + Sync>;

/// Callback producing a programmatic product table after install.
pub type ProductsCallback =
    Arc<dyn Fn(&ProductQuery<'_>) -> anyhow::Result<BTreeMap<String, String>> + Send + Sync>;

/// Where a recipe's canonical body comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchSource {
    /// A manifest file on the local filesystem.
    Local(Utf8PathBuf),
    /// A remote URL with an optional required digest (lowercase hex).
    Remote { url: String, digest: Option<String> },
    /// Body produced at run time by a custom-fetch callback.
    Inline,
}

impl fmt::Display for FetchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(p) => write!(f, "{p}"),
            Self::Remote { url, .. } => f.write_str(url),
            Self::Inline => f.write_str("<inline>"),
        }
    }
}

/// A recipe's declared products.
#[derive(Clone, Default)]
pub enum ProductsDecl {
    /// No products.
    #[default]
    None,
    /// Static `product name -> relative path` table, known at resolve time.
    Static(BTreeMap<String, String>),
    /// Programmatic table, produced after the provider installs.
    Dynamic(ProductsCallback),
}

impl ProductsDecl {
    /// Product names known without running anything. Empty for dynamic
    /// declarations.
    pub fn static_names(&self) -> impl Iterator<Item = &str> {
        match self {
            Self::Static(map) => Some(map.keys().map(String::as_str)),
            _ => None,
        }
        .into_iter()
        .flatten()
    }
}

impl fmt::Debug for ProductsDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Static(map) => f.debug_tuple("Static").field(map).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Optional per-phase callbacks of a recipe.
#[derive(Clone, Default)]
pub struct PhaseCallbacks {
    pub fetch: Option<PhaseCallback>,
    pub check: Option<CheckCallback>,
    pub stage: Option<PhaseCallback>,
    pub build: Option<PhaseCallback>,
    pub install: Option<PhaseCallback>,
    /// Shell used by `run` when the context does not override it.
    pub default_shell: Option<ShellKind>,
}

impl PhaseCallbacks {
    /// The callback for an ordinary (non-check) phase, if declared.
    #[must_use]
    pub fn for_phase(&self, phase: Phase) -> Option<&PhaseCallback> {
        match phase {
            Phase::Fetch => self.fetch.as_ref(),
            Phase::Stage => self.stage.as_ref(),
            Phase::Build => self.build.as_ref(),
            Phase::Install => self.install.as_ref(),
            Phase::Check | Phase::Completion => None,
        }
    }
}

impl fmt::Debug for PhaseCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |o: bool| if o { "set" } else { "-" };
        write!(
            f,
            "PhaseCallbacks(fetch: {}, check: {}, stage: {}, build: {}, install: {})",
            set(self.fetch.is_some()),
            set(self.check.is_some()),
            set(self.stage.is_some()),
            set(self.build.is_some()),
            set(self.install.is_some()),
        )
    }
}

/// A strong dependency declaration: concrete identity, source, options.
#[derive(Clone)]
pub struct StrongDep {
    pub identity: Identity,
    pub source: FetchSource,
    pub options: OptionTable,
    pub needed_by: Option<Phase>,
}

impl StrongDep {
    #[must_use]
    pub fn new(identity: Identity, source: FetchSource) -> Self {
        Self {
            identity,
            source,
            options: OptionTable::new(),
            needed_by: None,
        }
    }

    #[must_use]
    pub fn with_option(mut self, name: &str, value: impl Into<OptionValue>) -> Self {
        self.options.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub const fn needed_by(mut self, phase: Phase) -> Self {
        self.needed_by = Some(phase);
        self
    }

    /// Canonical key this dependency resolves to.
    pub fn key(&self) -> Result<RecipeKey, OptionError> {
        Ok(format_key(&self.identity, &serialize_options(&self.options)?))
    }
}

impl fmt::Debug for StrongDep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrongDep({})", self.identity)
    }
}

/// How a product dependency pins its provider.
#[derive(Debug, Clone)]
pub enum ProductTarget {
    /// Pin to a concrete recipe, instantiated if absent.
    Strong(StrongDep),
    /// Pin to an already-present recipe matching the pattern; never
    /// instantiates anything.
    RefOnly(Identity),
}

/// Inline body of a custom-fetch dependency: the statically known
/// dependencies plus the callback that materializes the recipe body.
#[derive(Clone)]
pub struct InlineBody {
    pub dependencies: Vec<DepSpec>,
    pub fetch: FetchBodyCallback,
}

impl fmt::Debug for InlineBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InlineBody({} deps)", self.dependencies.len())
    }
}

/// A dependency declaration. Closed set of variants; `needed_by` defaults
/// come from a single table (see [`DepSpec::effective_needed_by`]).
#[derive(Debug, Clone)]
pub enum DepSpec {
    /// Concrete recipe, instantiated if absent.
    Strong(StrongDep),
    /// Reference to any already-present recipe matching the pattern.
    RefOnly {
        pattern: Identity,
        needed_by: Option<Phase>,
    },
    /// Resolves to a matching recipe if present, otherwise instantiates
    /// the fallback.
    Weak {
        target: Identity,
        fallback: StrongDep,
        needed_by: Option<Phase>,
    },
    /// Reference by product name, optionally pinned to a provider.
    Product {
        name: String,
        target: Option<ProductTarget>,
        weak_fallback: Option<StrongDep>,
        needed_by: Option<Phase>,
    },
    /// Child recipe whose body is produced during the parent's fetch phase.
    CustomFetch {
        identity: Identity,
        inline: InlineBody,
        needed_by: Option<Phase>,
    },
}

impl DepSpec {
    /// The single source table of `needed_by` defaults.
    #[must_use]
    pub const fn default_needed_by(&self) -> Phase {
        match self {
            Self::RefOnly { .. } | Self::Product { .. } => Phase::Check,
            Self::CustomFetch { .. } => Phase::Build,
            Self::Strong(_) | Self::Weak { .. } => Phase::Completion,
        }
    }

    /// The phase of the parent by which this dependency must be satisfied.
    #[must_use]
    pub const fn effective_needed_by(&self) -> Phase {
        let explicit = match self {
            Self::Strong(StrongDep { needed_by, .. })
            | Self::RefOnly { needed_by, .. }
            | Self::Weak { needed_by, .. }
            | Self::Product { needed_by, .. }
            | Self::CustomFetch { needed_by, .. } => needed_by,
        };
        match explicit {
            Some(p) => *p,
            None => self.default_needed_by(),
        }
    }

    /// Human-readable target description for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Strong(s) => s.identity.to_string(),
            Self::RefOnly { pattern, .. } => format!("ref:{pattern}"),
            Self::Weak { target, .. } => format!("weak:{target}"),
            Self::Product { name, .. } => format!("product:{name}"),
            Self::CustomFetch { identity, .. } => format!("custom-fetch:{identity}"),
        }
    }
}

/// An immutable, interned recipe specification.
pub struct RecipeSpec {
    identity: Identity,
    source: FetchSource,
    options: OptionTable,
    serialized_options: String,
    dependencies: Vec<DepSpec>,
    products: ProductsDecl,
    callbacks: PhaseCallbacks,
    manifest_root: Utf8PathBuf,
    key: OnceCell<RecipeKey>,
}

impl RecipeSpec {
    /// Start building a spec for `identity`.
    #[must_use]
    pub fn builder(identity: Identity) -> SpecBuilder {
        SpecBuilder {
            identity,
            source: FetchSource::Inline,
            options: OptionTable::new(),
            dependencies: Vec::new(),
            products: ProductsDecl::None,
            callbacks: PhaseCallbacks::default(),
            manifest_root: Utf8PathBuf::from("."),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub const fn source(&self) -> &FetchSource {
        &self.source
    }

    #[must_use]
    pub const fn options(&self) -> &OptionTable {
        &self.options
    }

    #[must_use]
    pub fn serialized_options(&self) -> &str {
        &self.serialized_options
    }

    #[must_use]
    pub fn dependencies(&self) -> &[DepSpec] {
        &self.dependencies
    }

    #[must_use]
    pub const fn products(&self) -> &ProductsDecl {
        &self.products
    }

    #[must_use]
    pub const fn callbacks(&self) -> &PhaseCallbacks {
        &self.callbacks
    }

    #[must_use]
    pub fn manifest_root(&self) -> &Utf8PathBuf {
        &self.manifest_root
    }

    /// The strong key, computed lazily and cached.
    pub fn key(&self) -> &RecipeKey {
        self.key
            .get_or_init(|| format_key(&self.identity, &self.serialized_options))
    }

    /// A recipe is user-managed iff it declares a `check` callback.
    #[must_use]
    pub fn is_user_managed(&self) -> bool {
        self.callbacks.check.is_some()
    }

    /// Instantiate this spec with dependency-supplied options merged over
    /// its own. Used by the resolver when a dependency pins options on a
    /// recipe it instantiates.
    pub fn with_options(&self, overrides: &OptionTable) -> Result<Self, OptionError> {
        let mut options = self.options.clone();
        for (k, v) in overrides {
            options.insert(k.clone(), v.clone());
        }
        let serialized_options = serialize_options(&options)?;
        Ok(Self {
            identity: self.identity.clone(),
            source: self.source.clone(),
            options,
            serialized_options,
            dependencies: self.dependencies.clone(),
            products: self.products.clone(),
            callbacks: self.callbacks.clone(),
            manifest_root: self.manifest_root.clone(),
            key: OnceCell::new(),
        })
    }
}

impl fmt::Debug for RecipeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecipeSpec")
            .field("identity", &self.identity)
            .field("source", &self.source)
            .field("options", &self.serialized_options)
            .field("dependencies", &self.dependencies.len())
            .field("products", &self.products)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

/// Builder for [`RecipeSpec`]; the manifest loader drives this, and tests
/// use it directly.
pub struct SpecBuilder {
    identity: Identity,
    source: FetchSource,
    options: OptionTable,
    dependencies: Vec<DepSpec>,
    products: ProductsDecl,
    callbacks: PhaseCallbacks,
    manifest_root: Utf8PathBuf,
}

impl SpecBuilder {
    #[must_use]
    pub fn source(mut self, source: FetchSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn option(mut self, name: &str, value: impl Into<OptionValue>) -> Self {
        self.options.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn dependency(mut self, dep: DepSpec) -> Self {
        self.dependencies.push(dep);
        self
    }

    #[must_use]
    pub fn static_product(mut self, name: &str, relative_path: &str) -> Self {
        if !matches!(self.products, ProductsDecl::Static(_)) {
            self.products = ProductsDecl::Static(BTreeMap::new());
        }
        if let ProductsDecl::Static(map) = &mut self.products {
            map.insert(name.to_string(), relative_path.to_string());
        }
        self
    }

    #[must_use]
    pub fn dynamic_products(mut self, cb: ProductsCallback) -> Self {
        self.products = ProductsDecl::Dynamic(cb);
        self
    }

    #[must_use]
    pub fn on_fetch(mut self, cb: PhaseCallback) -> Self {
        self.callbacks.fetch = Some(cb);
        self
    }

    #[must_use]
    pub fn on_check(mut self, cb: CheckCallback) -> Self {
        self.callbacks.check = Some(cb);
        self
    }

    #[must_use]
    pub fn on_stage(mut self, cb: PhaseCallback) -> Self {
        self.callbacks.stage = Some(cb);
        self
    }

    #[must_use]
    pub fn on_build(mut self, cb: PhaseCallback) -> Self {
        self.callbacks.build = Some(cb);
        self
    }

    #[must_use]
    pub fn on_install(mut self, cb: PhaseCallback) -> Self {
        self.callbacks.install = Some(cb);
        self
    }

    #[must_use]
    pub const fn default_shell(mut self, shell: ShellKind) -> Self {
        self.callbacks.default_shell = Some(shell);
        self
    }

    #[must_use]
    pub fn manifest_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.manifest_root = root.into();
        self
    }

    /// Finalize the spec, computing the canonical option serialization.
    pub fn build(self) -> Result<RecipeSpec, OptionError> {
        let serialized_options = serialize_options(&self.options)?;
        Ok(RecipeSpec {
            identity: self.identity,
            source: self.source,
            options: self.options,
            serialized_options,
            dependencies: self.dependencies,
            products: self.products,
            callbacks: self.callbacks,
            manifest_root: self.manifest_root,
            key: OnceCell::new(),
        })
    }
}

/// Stable handle into the spec pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpecId(u32);

impl SpecId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Owner of every spec loaded during one engine run.
///
/// Interning is by key: two loads of the same `(identity, options)` yield
/// the same `SpecId` and the same shared record.
#[derive(Debug, Default)]
pub struct SpecPool {
    specs: Vec<Arc<RecipeSpec>>,
    by_key: HashMap<RecipeKey, SpecId>,
}

impl SpecPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a spec, deduplicating by key.
    pub fn intern(&mut self, spec: RecipeSpec) -> (SpecId, Arc<RecipeSpec>) {
        let key = spec.key().clone();
        if let Some(&id) = self.by_key.get(&key) {
            return (id, Arc::clone(&self.specs[id.index()]));
        }
        let id = SpecId(u32::try_from(self.specs.len()).expect("spec pool overflow"));
        let shared = Arc::new(spec);
        self.specs.push(Arc::clone(&shared));
        self.by_key.insert(key, id);
        (id, shared)
    }

    /// Replace the interned spec for its key, returning the new shared
    /// record. Used when a custom-fetch placeholder is materialized into
    /// the real spec.
    pub fn replace(&mut self, spec: RecipeSpec) -> Arc<RecipeSpec> {
        let key = spec.key().clone();
        let shared = Arc::new(spec);
        match self.by_key.get(&key) {
            Some(&id) => self.specs[id.index()] = Arc::clone(&shared),
            None => {
                let id = SpecId(u32::try_from(self.specs.len()).expect("spec pool overflow"));
                self.specs.push(Arc::clone(&shared));
                self.by_key.insert(key, id);
            }
        }
        shared
    }

    /// Look up an interned spec by key.
    #[must_use]
    pub fn by_key(&self, key: &RecipeKey) -> Option<&Arc<RecipeSpec>> {
        self.by_key.get(key).map(|id| &self.specs[id.index()])
    }

    #[must_use]
    pub fn get(&self, id: SpecId) -> &Arc<RecipeSpec> {
        &self.specs[id.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
