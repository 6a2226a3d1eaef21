//! Finalizer support for userdata.
//!
//! Plain Lua values never run user code on collection; only userdata
//! objects that were registered with [`Finalizers::register`] do, via the
//! embedder-supplied callback installed for their `__gc` metamethod. The
//! registry is consulted by `ember-runtime` after a sweep, not by the
//! collector itself, since running a finalizer means calling back into the
//! VM -- something `ember-gc` has no notion of.

mod finalizer;

pub use finalizer::{FinalizerRegistry, PendingFinalizer};
