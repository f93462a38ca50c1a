//! Wait/activation primitives shared by sink and source frame channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A flag that can be raised once and never lowered.
#[derive(Debug, Default)]
pub(crate) struct Latch(AtomicBool);

impl Latch {
    pub(crate) fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Raise the flag. Returns `true` only for the call that raised it.
    pub(crate) fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Local copy of a caller's suspend/resume preference while a frame is
/// inactive.
#[derive(Debug, Default)]
pub(crate) struct SuspendCache(AtomicBool);

impl SuspendCache {
    pub(crate) fn suspend(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn resume(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct GateState {
    waiters: usize,
    opened: bool,
    released: bool,
}

/// Parking spot for threads that block on an inactive frame.
///
/// Guarded by its own lock, never held across transport or owner calls.
#[derive(Debug, Default)]
pub(crate) struct WaitGate {
    state: Mutex<GateState>,
    condvar: Condvar,
}

impl WaitGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Block until the gate opens, is released, or `timeout` elapses.
    ///
    /// Returns `true` when the wait ended because the gate opened or was
    /// released; `false` on timeout.
    pub(crate) fn park(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        if state.opened || state.released {
            return true;
        }
        state.waiters += 1;
        let mut timed_out = false;
        while !(state.opened || state.released) {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut state, deadline).timed_out() {
                        timed_out = !(state.opened || state.released);
                        break;
                    }
                }
                None => self.condvar.wait(&mut state),
            }
        }
        state.waiters -= 1;
        !timed_out
    }

    /// Open the gate and wake every parked thread.
    ///
    /// Returns `None` if the gate was already open, otherwise the number of
    /// threads that were parked.
    pub(crate) fn open(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.opened {
            return None;
        }
        state.opened = true;
        let waiters = state.waiters;
        if waiters > 0 {
            self.condvar.notify_all();
        }
        Some(waiters)
    }

    /// Wake every parked thread without opening the gate (used on close).
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        state.released = true;
        if state.waiters > 0 {
            self.condvar.notify_all();
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().opened
    }

    pub(crate) fn waiters(&self) -> usize {
        self.state.lock().waiters
    }
}
