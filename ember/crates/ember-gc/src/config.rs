//! Collector tuning knobs.
//!
//! Unlike a concurrent/generational collector there is no pause-time target
//! or thread pool to configure: the only real lever is how much garbage is
//! allowed to accumulate between stop-the-world cycles.

/// Configuration for a [`crate::Heap`].
///
/// ```rust
/// use ember_gc::GcConfig;
/// let config = GcConfig::default();
/// let config = GcConfig { growth_factor: 1.5, ..Default::default() };
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcConfig {
    /// Bytes of live data assumed present at startup, before any
    /// allocation has happened. Keeps the first cycle from firing too
    /// early on a cold heap.
    pub initial_threshold: usize,

    /// How much the debt threshold grows after a cycle, relative to the
    /// bytes still live once that cycle finished. A full mark phase runs
    /// whenever cumulative allocation since the last cycle exceeds
    /// `live_bytes * growth_factor`.
    pub growth_factor: f64,

    /// Emit a `tracing` event at the start and end of every collection
    /// cycle, with byte counts and duration.
    pub log_cycles: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            initial_threshold: 1 << 20,
            growth_factor: 2.0,
            log_cycles: true,
        }
    }
}
