//! Library-level error taxonomy.
//!
//! Errors are grouped by origin: identity/option parsing, resolution,
//! cache-store access, locking, and phase execution. Resolution errors are
//! fatal for the containing command; phase errors mark one recipe `Failed`
//! and propagate to its dependents as [`PhaseError::Prerequisite`].

use thiserror::Error;

/// Identity parse failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity is empty")]
    Empty,

    #[error("identity '{0}' is missing an '@revision' suffix")]
    MissingRevision(String),

    #[error("identity '{0}' has an empty revision")]
    EmptyRevision(String),

    #[error("identity '{identity}' has an empty name segment")]
    EmptySegment { identity: String },

    #[error("identity '{identity}' contains invalid character '{ch}'")]
    InvalidCharacter { identity: String, ch: char },
}

/// Option-table serialization failures.
#[derive(Debug, Error)]
pub enum OptionError {
    #[error("option table could not be canonically serialized: {reason}")]
    BadOptionSerialization { reason: String },
}

/// Fatal graph-resolution errors. No partial graph is exposed when any of
/// these occur.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("recipe '{identity}' not found")]
    NotFound { identity: String },

    #[error("dependency pattern '{pattern}' of '{wanted_by}' matches {} recipes: {}", .candidates.len(), .candidates.join(", "))]
    AmbiguousDependency {
        pattern: String,
        wanted_by: String,
        candidates: Vec<String>,
    },

    #[error("product '{name}' is provided by {} recipes: {}", .providers.len(), .providers.join(", "))]
    AmbiguousProduct {
        name: String,
        providers: Vec<String>,
    },

    #[error("dependency '{pattern}' of '{wanted_by}' could not be resolved")]
    UnresolvedDependency { pattern: String, wanted_by: String },

    #[error("dependency cycle: {}", .chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    #[error("resolution did not converge after {iterations} passes")]
    Diverged { iterations: u32 },

    #[error("manifest for '{identity}' is invalid: {reason}")]
    BadManifest { identity: String, reason: String },

    #[error("loader failed for '{identity}': {source}")]
    Loader {
        identity: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Options(#[from] OptionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors related to cache-entry lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock '{path}' is held by another process{}", .holder_pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    Contention {
        path: String,
        holder_pid: Option<u32>,
    },

    #[error("io error during lock operation on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Cache-store failures outside of locking.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("'{name}' is not a valid archive name")]
    BadArchiveName { name: String },

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Entry(#[from] anyhow::Error),
}

/// Per-recipe phase failures. These are terminal for the recipe and
/// propagate to dependents, but never abort unrelated branches.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("recipe '{recipe}' accessed undeclared dependency '{wanted}'")]
    UndeclaredAccess { recipe: String, wanted: String },

    #[error("fetch of '{source_id}' failed: {reason}")]
    Fetch { source_id: String, reason: String },

    #[error("extraction of '{archive}' failed: {reason}")]
    Extract { archive: String, reason: String },

    #[error("digest mismatch for '{source_id}': expected {expected}, got {actual}")]
    HashMismatch {
        source_id: String,
        expected: String,
        actual: String,
    },

    #[error("subprocess exited with code {code}")]
    ShellExit { code: i32 },

    #[error("subprocess could not run: {reason}")]
    Subprocess { reason: String },

    #[error("subprocess timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("prerequisite '{dep}' failed: {reason}")]
    Prerequisite { dep: String, reason: String },

    #[error("callback failed: {0}")]
    Callback(#[source] anyhow::Error),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resolve(#[from] Box<ResolveError>),
}

impl PhaseError {
    /// True when the failure is cooperative cancellation rather than a
    /// genuine error.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Top-level error type returned by engine entry points.
#[derive(Debug, Error)]
pub enum GalleyError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("recipe '{key}' failed: {reason}")]
    RecipeFailed { key: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_display_with_and_without_pid() {
        let with_pid = LockError::Contention {
            path: "/c/locks/x.lock".into(),
            holder_pid: Some(42),
        };
        assert!(with_pid.to_string().contains("(pid 42)"));

        let without = LockError::Contention {
            path: "/c/locks/x.lock".into(),
            holder_pid: None,
        };
        assert!(!without.to_string().contains("pid"));
    }

    #[test]
    fn test_cycle_display_chains_identities() {
        let err = ResolveError::Cycle {
            chain: vec!["a@1".into(), "b@1".into(), "a@1".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a@1 -> b@1 -> a@1");
    }

    #[test]
    fn test_phase_error_cancelled_predicate() {
        assert!(PhaseError::Cancelled.is_cancelled());
        assert!(!PhaseError::ShellExit { code: 1 }.is_cancelled());
    }

    #[test]
    fn test_resolve_error_wraps_into_galley_error() {
        let err: GalleyError = ResolveError::NotFound {
            identity: "x@1".into(),
        }
        .into();
        assert!(matches!(err, GalleyError::Resolve(_)));
    }
}
