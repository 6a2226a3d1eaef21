//! Object header and tracing primitives shared by every heap allocation.

mod header;

pub use header::{Color, GcHeader, ObjectKind, Trace};
pub(crate) use header::GcBox;
