//! Recipe identities and the key algebra built on top of them.
//!
//! An identity is the string `namespace.name@revision`: a dotted path of
//! `[A-Za-z0-9_-]` tokens plus an opaque non-empty revision. Identities are
//! compared by exact byte equality. Pattern matching accepts any
//! suffix-preserving prefix of the dotted path (`gcc@r2` matches
//! `arm.gcc@r2` but not `gcc-arm@r2`).
//!
//! A recipe's *key* is the identity plus its canonical option serialization;
//! the *variant hash* additionally folds in the digests of any weak-fallback
//! recipes the resolver instantiated for it, so two resolutions that picked
//! different fallbacks land in different cache entries.

use crate::error::IdentityError;
use crate::hash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of digest bytes folded into a variant hash (16 hex characters).
pub const VARIANT_HASH_BYTES: usize = 8;

/// A validated `namespace.name@revision` identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity {
    full: String,
    /// Byte offset of the `@` separating path from revision.
    rev_at: usize,
}

impl Identity {
    /// Parse and validate an identity string.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        let Some(rev_at) = s.find('@') else {
            return Err(IdentityError::MissingRevision(s.to_string()));
        };
        let (path, rev) = (&s[..rev_at], &s[rev_at + 1..]);
        if rev.is_empty() {
            return Err(IdentityError::EmptyRevision(s.to_string()));
        }
        if rev.chars().any(char::is_whitespace) {
            return Err(IdentityError::InvalidCharacter {
                identity: s.to_string(),
                ch: ' ',
            });
        }
        if path.is_empty() {
            return Err(IdentityError::EmptySegment {
                identity: s.to_string(),
            });
        }
        for segment in path.split('.') {
            if segment.is_empty() {
                return Err(IdentityError::EmptySegment {
                    identity: s.to_string(),
                });
            }
            if let Some(ch) = segment
                .chars()
                .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
            {
                return Err(IdentityError::InvalidCharacter {
                    identity: s.to_string(),
                    ch,
                });
            }
        }
        Ok(Self {
            full: s.to_string(),
            rev_at,
        })
    }

    /// The full `namespace.name@revision` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }

    /// The dotted path before the `@`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.full[..self.rev_at]
    }

    /// The opaque revision after the `@`.
    #[must_use]
    pub fn revision(&self) -> &str {
        &self.full[self.rev_at + 1..]
    }

    /// The final path segment (the bare recipe name).
    #[must_use]
    pub fn leaf(&self) -> &str {
        self.path().rsplit('.').next().unwrap_or(self.path())
    }

    /// Whether this identity matches `pattern`.
    ///
    /// True when the two are equal, or when `pattern` equals this identity
    /// after stripping a leading dotted prefix from the path.
    #[must_use]
    pub fn matches(&self, pattern: &Self) -> bool {
        if self.revision() != pattern.revision() {
            return false;
        }
        let (path, pat) = (self.path(), pattern.path());
        path == pat
            || (path.len() > pat.len()
                && path.ends_with(pat)
                && path.as_bytes()[path.len() - pat.len() - 1] == b'.')
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.full
    }
}

/// Canonical key of a graph node: the identity, plus `?` and the canonical
/// option serialization when options are present.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecipeKey(String);

impl RecipeKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build the canonical key for `(identity, serialized_options)`.
///
/// `serialized_options` must already be canonical (see `options`); an empty
/// serialization yields the bare identity.
#[must_use]
pub fn format_key(identity: &Identity, serialized_options: &str) -> RecipeKey {
    if serialized_options.is_empty() {
        RecipeKey(identity.as_str().to_string())
    } else {
        RecipeKey(format!("{identity}?{serialized_options}"))
    }
}

/// Compute the 16-hex-char variant hash for a key and the digests of its
/// instantiated weak fallbacks.
///
/// The digest list is sorted internally so the hash is independent of
/// traversal order.
#[must_use]
pub fn variant_hash(key: &RecipeKey, fallback_digests: &[String]) -> String {
    let mut sorted: Vec<&str> = fallback_digests.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut input = String::with_capacity(key.as_str().len() + sorted.len() * 65 + 1);
    input.push_str(key.as_str());
    input.push('|');
    input.push_str(&sorted.join("|"));
    hash::hex_prefix(&hash::digest(input.as_bytes()), VARIANT_HASH_BYTES)
}

/// Digest an individual recipe key, as recorded in weak-fallback digest
/// lists.
#[must_use]
pub fn key_digest(key: &RecipeKey) -> String {
    hash::digest_hex(key.as_str().as_bytes())
}
