//! Wall-clock timing for a single collection cycle.

use std::time::{Duration, Instant};

/// Measures the duration of one mark/sweep cycle.
///
/// Kept separate from [`super::GcStats`] so `Heap::mark_from_roots` and
/// `Heap::sweep` can each be timed independently when a caller wants to
/// know how much of a cycle was marking versus sweeping.
pub struct CycleTimer {
    started: Instant,
}

impl CycleTimer {
    pub fn start() -> Self {
        CycleTimer {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
