//! Time abstraction.
//!
//! Every timestamp the stack records (`last_tx_time`, `last_rx_time`,
//! peer hold-off deadlines) goes through a [`Clock`] rather than calling
//! `Instant::now()` directly, so that tests can drive time deterministically
//! instead of sleeping in real time.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use web_time::Instant;

/// Something that can report the current instant.
///
/// [`SystemClock`] is backed by the platform clock; [`VirtualClock`] is a
/// manually-advanced clock used in tests.
pub trait Clock {
    /// Returns the current instant, per this clock's notion of time.
    fn now(&self) -> Instant;
}

/// The platform wall clock, via [`web_time::Instant`] (which resolves to
/// `std::time::Instant` natively and `performance.now()` on wasm).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually-advanced clock for deterministic tests.
///
/// Cloning shares the underlying instant, so a clone can be handed to the
/// code under test while the original is advanced by the test driver.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: Rc<Cell<Instant>>,
}

impl VirtualClock {
    /// Creates a new virtual clock starting at [`Instant::now`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    /// Advances this clock (and every clone of it) by `dt`.
    pub fn advance(&self, dt: Duration) {
        self.now.set(self.now.get() + dt);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

/// A timestamp that may be "never set", used for `last_tx_time` on a
/// transfer that has not yet transmitted anything.
pub type MaybeInstant = Option<Instant>;

/// Returns whether `since` (if set) is older than `timeout` relative to
/// `now`. A `None` timestamp is always considered not-yet-timed-out: a
/// transfer that has never sent/received anything is timed by its creation
/// time instead, tracked separately by callers.
#[must_use]
pub fn older_than(since: MaybeInstant, now: Instant, timeout: Duration) -> bool {
    match since {
        Some(t) => now.saturating_duration_since(t) >= timeout,
        None => false,
    }
}
