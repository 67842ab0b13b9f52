use crate::loom::sync::atomic::{
    self, AtomicUsize,
    Ordering::{self, *},
};
use crate::util::Backoff;
use core::fmt;

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct State<usize> {
        /// The task's position in its lifecycle.
        ///
        /// Monotone: once a [`Stage`] is terminal, it never changes again.
        pub(crate) const STAGE: Stage;

        /// If set, the task's result has been moved out by a
        /// single-consumer reader, and must not be dropped again.
        pub(crate) const CONSUMED: bool;

        /// If set, an externally-completable task has already vended its
        /// consumer handle.
        pub(crate) const HAS_HANDLE: bool;

        /// If set, the task's storage slot currently holds the type-erased
        /// scheduler it should be submitted to. Cleared when dispatch takes
        /// the scheduler out of the slot.
        pub(crate) const HAS_SCHED: bool;

        /// The number of currently live references to this task.
        ///
        /// When this is 0, the task may be deallocated.
        const REFS = ..;
    }
}

/// A task's position in its lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Stage {
    /// The task has not run yet.
    Pending = 0b000,
    /// An external completer has reserved the terminal transition and is
    /// currently installing the result or fault.
    Locked = 0b001,
    /// The task's function returned an inner task; the task now observes
    /// the inner task's outcome.
    Unwrapped = 0b010,
    /// The task finished and a result is available. Terminal.
    Completed = 0b011,
    /// The task was canceled and a fault is available. Terminal.
    Canceled = 0b100,
}

/// An atomic cell that stores a task's current [`State`].
#[repr(transparent)]
pub(crate) struct StateCell(AtomicUsize);

const REF_ONE: usize = State::REFS.first_bit();
const REF_MAX: usize = State::REFS.raw_mask();

// === impl Stage ===

impl Stage {
    /// Returns `true` if this stage is `Completed` or `Canceled`.
    #[inline]
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Canceled)
    }
}

impl mycelium_bitfield::FromBits<usize> for Stage {
    type Error = &'static str;

    /// The number of bits required to represent a value of this type.
    const BITS: u32 = 3;

    #[inline]
    fn try_from_bits(bits: usize) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Pending as usize => Ok(Self::Pending),
            b if b == Self::Locked as usize => Ok(Self::Locked),
            b if b == Self::Unwrapped as usize => Ok(Self::Unwrapped),
            b if b == Self::Completed as usize => Ok(Self::Completed),
            b if b == Self::Canceled as usize => Ok(Self::Canceled),
            _ => Err("invalid task stage bit pattern"),
        }
    }

    #[inline]
    fn into_bits(self) -> usize {
        self as u8 as usize
    }
}

// === impl State ===

impl State {
    #[inline]
    pub(crate) fn stage(self) -> Stage {
        self.get(Self::STAGE)
    }

    #[inline]
    pub(crate) fn ref_count(self) -> usize {
        self.get(Self::REFS)
    }
}

// === impl StateCell ===

impl StateCell {
    /// Returns a new cell with a reference count of one, in the
    /// [`Pending`](Stage::Pending) stage.
    ///
    /// `has_sched` records whether the task's slot was initialized with a
    /// parked scheduler.
    pub(crate) fn new(has_sched: bool) -> Self {
        let state = State::new()
            .with(State::STAGE, Stage::Pending)
            .with(State::HAS_SCHED, has_sched);
        Self(AtomicUsize::new(state.0 + REF_ONE))
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> State {
        State(self.0.load(order))
    }

    #[inline]
    pub(crate) fn stage(&self, order: Ordering) -> Stage {
        self.load(order).stage()
    }

    /// Acquire test for a terminal stage.
    ///
    /// Observing `true` synchronizes-with the store that installed the
    /// result or fault.
    #[inline]
    pub(crate) fn ready(&self) -> bool {
        self.stage(Acquire).is_terminal()
    }

    /// Installs a terminal stage.
    ///
    /// The release half of the transition publishes the result or fault
    /// written to the slot before this call.
    pub(crate) fn finish(&self, stage: Stage) {
        debug_assert!(stage.is_terminal());
        self.transition(|state| {
            debug_assert!(
                !state.stage().is_terminal(),
                "task already reached a terminal stage! state: {state:?}",
            );
            state.set(State::STAGE, stage);
        })
    }

    /// Reserves the terminal transition for an external completer,
    /// CAS-swapping `Pending` for `Locked`.
    ///
    /// Returns `false` if the task is no longer `Pending`; the caller lost
    /// the completion race.
    pub(crate) fn try_lock(&self) -> bool {
        self.transition(|state| {
            if state.stage() != Stage::Pending {
                return false;
            }
            state.set(State::STAGE, Stage::Locked);
            true
        })
    }

    /// Marks the task as observing an inner task's outcome.
    pub(crate) fn set_unwrapped(&self) {
        self.transition(|state| {
            debug_assert_eq!(state.stage(), Stage::Pending);
            state.set(State::STAGE, Stage::Unwrapped);
        })
    }

    /// Marks the result as moved out of the slot.
    pub(crate) fn consume_result(&self) {
        self.transition(|state| {
            debug_assert_eq!(state.stage(), Stage::Completed);
            debug_assert!(
                !state.get(State::CONSUMED),
                "task result taken twice! state: {state:?}",
            );
            state.set(State::CONSUMED, true);
        })
    }

    /// Marks the scheduler as taken out of the slot.
    pub(crate) fn take_sched(&self) {
        self.transition(|state| {
            debug_assert!(
                state.get(State::HAS_SCHED),
                "task's scheduler taken twice! state: {state:?}",
            );
            state.set(State::HAS_SCHED, false);
        })
    }

    /// Claims the consumer handle of an externally-completable task.
    ///
    /// Returns `false` if the handle was already claimed.
    pub(crate) fn claim_handle(&self) -> bool {
        self.transition(|state| {
            if state.get(State::HAS_HANDLE) {
                return false;
            }
            state.set(State::HAS_HANDLE, true);
            true
        })
    }

    #[inline]
    pub(crate) fn clone_ref(&self) {
        // Using a relaxed ordering is alright here, as knowledge of the
        // original reference prevents other threads from erroneously
        // deleting the object; see the Boost `shared_ptr` documentation's
        // discussion of reference-count orderings.
        let old_refs = self.0.fetch_add(REF_ONE, Relaxed);
        test_dbg!(State::REFS.unpack(old_refs));

        // Guard against overflowing the reference count if someone is
        // `mem::forget`ing task references in a loop.
        if old_refs > REF_MAX {
            panic!("task reference count overflow");
        }
    }

    /// Drops a reference, returning `true` if the caller was the last
    /// holder and must destroy the task.
    #[inline]
    pub(crate) fn drop_ref(&self) -> bool {
        test_debug!("StateCell::drop_ref");
        // We do not need to synchronize with other threads unless we are
        // going to delete the task.
        let old_refs = self.0.fetch_sub(REF_ONE, Release);
        let old_refs = old_refs >> State::REFS.least_significant_index();

        // Did we drop the last ref?
        if test_dbg!(old_refs) > 1 {
            return false;
        }

        atomic::fence(Acquire);
        true
    }

    /// Advance this task's state by running the provided `transition`
    /// function on the current [`State`].
    #[cfg_attr(test, track_caller)]
    fn transition<T>(&self, mut transition: impl FnMut(&mut State) -> T) -> T {
        let mut backoff = Backoff::new();
        let mut current = self.load(Acquire);
        loop {
            let mut next = current;
            // Run the transition function.
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self
                .0
                .compare_exchange_weak(current.0, next.0, AcqRel, Acquire)
            {
                Ok(_) => return res,
                Err(actual) => current = State(actual),
            }
            backoff.spin();
        }
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Relaxed).fmt(f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn packing_specs_valid() {
        State::assert_valid()
    }

    #[test]
    fn new_cell_is_pending_with_one_ref() {
        let cell = StateCell::new(false);
        let state = cell.load(Relaxed);
        assert_eq!(state.stage(), Stage::Pending);
        assert_eq!(state.ref_count(), 1);
        assert!(!state.get(State::HAS_SCHED));
        assert!(!cell.ready());
    }

    #[test]
    fn terminal_stages_are_ready() {
        let cell = StateCell::new(false);
        cell.finish(Stage::Completed);
        assert!(cell.ready());
        assert_eq!(cell.stage(Relaxed), Stage::Completed);
    }

    #[test]
    fn lock_reserves_the_terminal_transition() {
        let cell = StateCell::new(false);
        assert!(cell.try_lock());
        // a second completer loses the race
        assert!(!cell.try_lock());
        cell.finish(Stage::Canceled);
        assert!(!cell.try_lock());
        assert_eq!(cell.stage(Relaxed), Stage::Canceled);
    }

    #[test]
    fn handle_claimed_at_most_once() {
        let cell = StateCell::new(false);
        assert!(cell.claim_handle());
        assert!(!cell.claim_handle());
    }

    #[test]
    fn ref_counting() {
        let cell = StateCell::new(false);
        cell.clone_ref();
        assert_eq!(cell.load(Relaxed).ref_count(), 2);
        assert!(!cell.drop_ref());
        assert!(cell.drop_ref());
    }

    #[test]
    fn sched_flag_roundtrip() {
        let cell = StateCell::new(true);
        assert!(cell.load(Relaxed).get(State::HAS_SCHED));
        cell.take_sched();
        assert!(!cell.load(Relaxed).get(State::HAS_SCHED));
    }
}
