//! A stop-the-world, tracing mark-and-sweep heap.
//!
//! `ember-gc` is deliberately simple: there is no generational nursery, no
//! concurrent or incremental marking, and no compaction. A collection
//! cycle always runs to completion with the mutator paused, which is
//! sufficient for an embedded scripting VM where pause times of a few
//! milliseconds are unobservable to the host application. See
//! [`heap::Heap`] for the allocation and collection API, and
//! [`object::Trace`] for what a type must implement to be heap-allocated.
//!
//! This crate knows nothing about Lua values, strings, or tables -- those
//! live in `ember-value`, built on top of [`Gc<T>`] and [`Trace`]. Keeping
//! the collector generic over `Trace` rather than over a fixed value enum
//! is what lets `ember-value` depend on `ember-gc` without a cycle.

mod config;
mod error;
mod heap;
mod object;
mod runtime;
mod stats;

pub use config::GcConfig;
pub use error::{GcError, Result};
pub use heap::{Gc, Heap, RootHandle};
pub use object::{Color, GcHeader, ObjectKind, Trace};
pub use runtime::{FinalizerRegistry, PendingFinalizer};
pub use stats::GcStats;
