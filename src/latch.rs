//! A core concept in Rayon is the *latch*. Fjord uses one per task to announce
//! that the task has reached a terminal state.

use crate::platform::*;

// -----------------------------------------------------------------------------
// States

/// The default state of a latch is `LOCKED`. When in the locked state, `probe`
/// returns `false` and `wait` blocks.
const LOCKED: u32 = 0b000;

/// Set once the latch has been opened. When this bit is set, `probe` returns
/// `true` and `wait` does not block.
const SIGNAL: u32 = 0b001;

/// Set when at least one thread outside the pool is (or is about to be) asleep
/// on the futex, and must be woken when the latch opens.
const ASLEEP: u32 = 0b010;

/// Set when a worker thread has parked on the pool's condition variable while
/// waiting for this latch. The thread that opens the latch is then responsible
/// for waking the pool.
const WATCHED: u32 = 0b100;

// -----------------------------------------------------------------------------
// Latch

/// A [`Latch`] is a one-shot signal used to indicate when an event has
/// occurred. The latch begins *unset* and can later be *set* by any thread.
/// Once set it stays set.
///
/// Two kinds of thread wait on a latch. Threads outside the pool block in
/// [`Latch::wait`], which sleeps on a futex. Worker threads never block here;
/// they keep running other jobs and, when they run out, park on the pool and
/// mark the latch as [watched](Latch::watch) so that whoever sets it also
/// wakes the pool.
pub struct Latch {
    state: AtomicU32,
}

impl Latch {
    /// Creates a new, unset latch.
    pub const fn new() -> Latch {
        Latch {
            state: AtomicU32::new(LOCKED),
        }
    }

    /// Checks to see if the latch has been set. Returns true if it has been.
    #[inline(always)]
    pub fn probe(&self) -> bool {
        self.state.load(Ordering::Acquire) & SIGNAL != 0
    }

    /// Opens the latch and wakes every thread sleeping in [`Latch::wait`].
    ///
    /// Returns true if a worker was watching the latch, in which case the
    /// caller must wake the pool's sleeping workers.
    pub fn set(&self) -> bool {
        let state = self.state.swap(SIGNAL, Ordering::SeqCst);
        debug_assert_eq!(state & SIGNAL, 0, "latch set twice");
        if state & ASLEEP != 0 {
            atomic_wait::wake_all(&self.state);
        }
        state & WATCHED != 0
    }

    /// Blocks the calling thread until the latch is set.
    pub fn wait(&self) {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state & SIGNAL != 0 {
                return;
            }
            let asleep = state | ASLEEP;
            if state == asleep
                || self
                    .state
                    .compare_exchange(state, asleep, Ordering::Acquire, Ordering::Acquire)
                    .is_ok()
            {
                // Returns immediately if the state changed in the meantime;
                // the loop mitigates that and spurious wake-ups.
                atomic_wait::wait(&self.state, asleep);
            }
        }
    }

    /// Marks the latch as watched by a worker that is about to park. Returns
    /// true if the latch had already been set, in which case the worker must
    /// not park.
    pub fn watch(&self) -> bool {
        self.state.fetch_or(WATCHED, Ordering::SeqCst) & SIGNAL != 0
    }
}

impl Default for Latch {
    fn default() -> Latch {
        Latch::new()
    }
}
