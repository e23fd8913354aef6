//! Product registry: maps product names to provider recipes.
//!
//! Static product declarations are registered while the resolver builds the
//! graph, so resolution-time lookups see them. Resolved values (a path
//! inside the provider's `install/`, or a raw string for user-managed
//! providers) and programmatic products only appear once the provider
//! reaches `install = Done`. Mutations are rare; an exclusive-lock map is
//! plenty.

use crate::identity::RecipeKey;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// One exported product, as reported to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    pub name: String,
    pub provider: RecipeKey,
    /// Resolved value; `None` until the provider has installed.
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
struct ProviderSlot {
    provider: RecipeKey,
    value: Option<String>,
}

/// Shared name → providers index.
#[derive(Debug, Default)]
pub struct ProductRegistry {
    inner: Mutex<BTreeMap<String, Vec<ProviderSlot>>>,
}

impl ProductRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace this registry's contents with another's. Used when a fresh
    /// resolution swaps in a new graph.
    pub fn adopt(&self, other: Self) {
        *self.inner.lock() = other.inner.into_inner();
    }

    /// Register a provider for `name` without a value yet (resolve time).
    /// Registering the same provider twice is a no-op.
    pub fn register_provider(&self, name: &str, provider: &RecipeKey) {
        let mut inner = self.inner.lock();
        let slots = inner.entry(name.to_string()).or_default();
        if !slots.iter().any(|s| &s.provider == provider) {
            slots.push(ProviderSlot {
                provider: provider.clone(),
                value: None,
            });
        }
    }

    /// Record the resolved value of `name` from `provider` (install time).
    /// Registers the provider if it was not known statically, which is how
    /// programmatic products become visible.
    pub fn record_value(&self, name: &str, provider: &RecipeKey, value: String) {
        let mut inner = self.inner.lock();
        let slots = inner.entry(name.to_string()).or_default();
        if let Some(slot) = slots.iter_mut().find(|s| &s.provider == provider) {
            slot.value = Some(value);
        } else {
            slots.push(ProviderSlot {
                provider: provider.clone(),
                value: Some(value),
            });
        }
    }

    /// All providers registered for `name`, in registration order.
    #[must_use]
    pub fn providers(&self, name: &str) -> Vec<RecipeKey> {
        self.inner
            .lock()
            .get(name)
            .map(|slots| slots.iter().map(|s| s.provider.clone()).collect())
            .unwrap_or_default()
    }

    /// The unique provider of `name`. `None` when the product is unknown
    /// or ambiguous; ambiguity is policed at dependency-resolution time.
    #[must_use]
    pub fn find_provider(&self, name: &str) -> Option<RecipeKey> {
        let inner = self.inner.lock();
        match inner.get(name).map(Vec::as_slice) {
            Some([only]) => Some(only.provider.clone()),
            _ => None,
        }
    }

    /// The resolved value of `name` from `provider`, if the provider has
    /// installed.
    #[must_use]
    pub fn value_from(&self, name: &str, provider: &RecipeKey) -> Option<String> {
        self.inner
            .lock()
            .get(name)?
            .iter()
            .find(|s| &s.provider == provider)
            .and_then(|s| s.value.clone())
    }

    /// Snapshot of every known product, sorted by name.
    #[must_use]
    pub fn collect_all(&self) -> Vec<ProductInfo> {
        self.inner
            .lock()
            .iter()
            .flat_map(|(name, slots)| {
                slots.iter().map(|slot| ProductInfo {
                    name: name.clone(),
                    provider: slot.provider.clone(),
                    value: slot.value.clone(),
                })
            })
            .collect()
    }
}
