//! Per-recipe runtime state: lock-free phase words plus the rare mutable
//! bits (failure reason, cache handle) behind small mutexes.

use crate::store::PkgHandle;
use crate::types::{Phase, PhaseState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// One atomic state byte per phase. A phase is claimed for execution by a
/// compare-and-swap from `Pending` to `InProgress`, which is what
/// guarantees at most one worker runs a given recipe's phase.
#[derive(Debug, Default)]
pub(crate) struct PhaseStates {
    slots: [AtomicU8; 6],
}

impl PhaseStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, phase: Phase) -> PhaseState {
        PhaseState::from_u8(self.slots[phase.index()].load(Ordering::Acquire))
    }

    /// Claim `phase` for execution. Returns false when another worker beat
    /// us to it (or it already ran).
    pub fn claim(&self, phase: Phase) -> bool {
        self.slots[phase.index()]
            .compare_exchange(
                PhaseState::Pending as u8,
                PhaseState::InProgress as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn mark_done(&self, phase: Phase) {
        self.slots[phase.index()].store(PhaseState::Done as u8, Ordering::Release);
    }

    pub fn mark_failed(&self, phase: Phase) {
        self.slots[phase.index()].store(PhaseState::Failed as u8, Ordering::Release);
    }

    /// Fail every phase that has not already completed.
    pub fn fail_remaining(&self) {
        for phase in Phase::ALL {
            if self.get(phase) != PhaseState::Done {
                self.mark_failed(phase);
            }
        }
    }

    /// The last phase of the contiguous completed prefix, if any.
    pub fn done_through(&self) -> Option<Phase> {
        let mut last = None;
        for phase in Phase::ALL {
            if self.get(phase) == PhaseState::Done {
                last = Some(phase);
            } else {
                break;
            }
        }
        last
    }

    /// State introspection utility.
    #[allow(dead_code)]
    pub fn any_failed(&self) -> bool {
        Phase::ALL.iter().any(|&p| self.get(p) == PhaseState::Failed)
    }
}

/// Mutable execution state of one graph node.
#[derive(Debug)]
pub(crate) struct RecipeRuntime {
    pub states: PhaseStates,
    /// First failure reason; later failures keep the original.
    pub failure: Mutex<Option<String>>,
    /// Cache write handle held across fetch..install on the slow path.
    pub handle: Mutex<Option<PkgHandle>>,
    /// Check callback reported the recipe satisfied.
    pub satisfied: AtomicBool,
    /// Highest demanded phase, encoded as index+1; 0 means undemanded.
    demand: AtomicU8,
}

impl RecipeRuntime {
    pub fn new() -> Self {
        Self {
            states: PhaseStates::new(),
            failure: Mutex::new(None),
            handle: Mutex::new(None),
            satisfied: AtomicBool::new(false),
            demand: AtomicU8::new(0),
        }
    }

    /// Raise the demanded phase to at least `phase`; true when it changed.
    pub fn raise_demand(&self, phase: Phase) -> bool {
        let wanted = phase.index() as u8 + 1;
        let mut current = self.demand.load(Ordering::Acquire);
        loop {
            if current >= wanted {
                return false;
            }
            match self.demand.compare_exchange_weak(
                current,
                wanted,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn demand(&self) -> Option<Phase> {
        match self.demand.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Phase::ALL[(raw - 1) as usize]),
        }
    }

    /// Record the first failure reason, fail remaining phases, and release
    /// any cache handle without marking completion (the entry will be
    /// re-done on the next attempt).
    pub fn fail(&self, reason: &str) -> bool {
        let mut failure = self.failure.lock();
        if failure.is_some() {
            return false;
        }
        *failure = Some(reason.to_string());
        drop(failure);
        self.states.fail_remaining();
        self.handle.lock().take();
        true
    }

    pub fn failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive() {
        let states = PhaseStates::new();
        assert!(states.claim(Phase::Fetch));
        assert!(!states.claim(Phase::Fetch), "second claim must lose");
        states.mark_done(Phase::Fetch);
        assert!(!states.claim(Phase::Fetch), "done phases cannot be claimed");
    }

    #[test]
    fn test_done_through_requires_contiguity() {
        let states = PhaseStates::new();
        assert_eq!(states.done_through(), None);

        states.mark_done(Phase::Fetch);
        states.mark_done(Phase::Check);
        assert_eq!(states.done_through(), Some(Phase::Check));

        // A later phase done out of order does not extend the prefix.
        states.mark_done(Phase::Build);
        assert_eq!(states.done_through(), Some(Phase::Check));

        states.mark_done(Phase::Stage);
        assert_eq!(states.done_through(), Some(Phase::Build));
    }

    #[test]
    fn test_demand_is_monotonic() {
        let rt = RecipeRuntime::new();
        assert_eq!(rt.demand(), None);
        assert!(rt.raise_demand(Phase::Check));
        assert_eq!(rt.demand(), Some(Phase::Check));
        assert!(rt.raise_demand(Phase::Install));
        assert!(!rt.raise_demand(Phase::Stage), "lower demand is a no-op");
        assert_eq!(rt.demand(), Some(Phase::Install));
    }

    #[test]
    fn test_fail_records_first_reason_only() {
        let rt = RecipeRuntime::new();
        rt.states.mark_done(Phase::Fetch);
        assert!(rt.fail("first"));
        assert!(!rt.fail("second"));
        assert_eq!(rt.failure_reason().as_deref(), Some("first"));
        // Completed phases stay done, the rest are failed.
        assert_eq!(rt.states.get(Phase::Fetch), PhaseState::Done);
        assert_eq!(rt.states.get(Phase::Build), PhaseState::Failed);
        assert!(rt.states.any_failed());
    }
}
