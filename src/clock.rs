//! Time sources for the logical state clock
//!
//! Graphs stamp writes with `now()` from a [`Clock`]. Production graphs use
//! wall-clock milliseconds; tests inject a [`ManualClock`] to drive
//! future-state replay deterministically.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::entry::State;

/// Source of the current logical time.
pub trait Clock: Send + Sync {
    fn now(&self) -> State;
}

/// Milliseconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> State {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: State) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: State) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move the clock forward by `delta` and return the new time.
    pub fn advance(&self, delta: State) -> State {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for ManualClock {
    fn now(&self) -> State {
        self.now.load(Ordering::SeqCst)
    }
}
