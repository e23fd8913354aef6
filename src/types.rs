//! Core vocabulary shared across the engine: phases, per-phase execution
//! states, recipe management policy, and final outcomes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A build phase. Phases are totally ordered; a recipe walks them front to
/// back and never revisits an earlier phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fetch,
    Check,
    Stage,
    Build,
    Install,
    Completion,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Self; 6] = [
        Self::Fetch,
        Self::Check,
        Self::Stage,
        Self::Build,
        Self::Install,
        Self::Completion,
    ];

    /// Returns the string representation of the phase
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Check => "check",
            Self::Stage => "stage",
            Self::Build => "build",
            Self::Install => "install",
            Self::Completion => "completion",
        }
    }

    /// Position of the phase in execution order (fetch = 0).
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Fetch => 0,
            Self::Check => 1,
            Self::Stage => 2,
            Self::Build => 3,
            Self::Install => 4,
            Self::Completion => 5,
        }
    }

    /// The phase that follows this one, or `None` after `completion`.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Fetch => Some(Self::Check),
            Self::Check => Some(Self::Stage),
            Self::Stage => Some(Self::Build),
            Self::Build => Some(Self::Install),
            Self::Install => Some(Self::Completion),
            Self::Completion => None,
        }
    }

    /// Parse a phase name as it appears in manifests and sentinels.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == s)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state of a single phase of a single recipe.
///
/// Stored as one byte so the engine can CAS it; see `engine::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PhaseState {
    Pending = 0,
    InProgress = 1,
    Done = 2,
    Failed = 3,
}

impl PhaseState {
    /// Decode from the raw byte the engine keeps in its atomics.
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::InProgress,
            2 => Self::Done,
            3 => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Whether a recipe's result lives in the content-addressed cache or
/// reflects external system state detected by a `check` callback.
///
/// The type is `Unknown` until resolution inspects the spec's callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeType {
    CacheManaged,
    UserManaged,
    Unknown,
}

/// Final outcome of one recipe after an engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipeOutcome {
    Done,
    Failed { reason: String },
}

impl RecipeOutcome {
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Result of a user-managed recipe's `check` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The external system state already satisfies the recipe; the engine
    /// skips stage..install and purges the cache entry.
    Satisfied,
    /// The recipe must run its remaining phases.
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_total() {
        for pair in Phase::ALL.windows(2) {
            assert!(pair[0] < pair[1], "{} must precede {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_phase_next_walks_all() {
        let mut phase = Phase::Fetch;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen, Phase::ALL);
    }

    #[test]
    fn test_phase_parse_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::parse("deploy"), None);
        assert_eq!(Phase::parse(""), None);
    }

    #[test]
    fn test_phase_index_matches_position() {
        for (i, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
    }

    #[test]
    fn test_phase_state_from_u8() {
        assert_eq!(PhaseState::from_u8(0), PhaseState::Pending);
        assert_eq!(PhaseState::from_u8(1), PhaseState::InProgress);
        assert_eq!(PhaseState::from_u8(2), PhaseState::Done);
        assert_eq!(PhaseState::from_u8(3), PhaseState::Failed);
        // Out-of-range bytes decode conservatively as Pending.
        assert_eq!(PhaseState::from_u8(200), PhaseState::Pending);
    }
}
