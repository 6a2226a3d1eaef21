//! The traced heap: allocation, root registration, and the mark/sweep
//! cycle.
//!
//! Collection is split into two public steps, [`Heap::mark_from_roots`] and
//! [`Heap::sweep`], rather than a single `collect()`. The caller (the `State`
//! in `ember-runtime`) needs to step in between them: the interned string
//! pool in `ember-value` holds *weak* references to its strings, so it is
//! not itself a root, and entries that didn't get marked must be unlinked
//! from the pool's own chains before `sweep` frees their backing memory.
//! Running `sweep` without first letting the string pool drop its weak
//! entries would leave it holding dangling pointers.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::object::{Color, GcBox, GcHeader, Trace};
use crate::stats::GcStats;

/// A traced reference to a heap-allocated `T`.
///
/// `Gc<T>` is `Copy` and carries no destructor: the pointee is only ever
/// freed by [`Heap::sweep`]. Dereferencing a `Gc<T>` after its heap has been
/// dropped is undefined behavior, same as any other raw pointer; the VM is
/// responsible for not outliving its own heap.
pub struct Gc<T: Trace> {
    ptr: NonNull<GcBox<T>>,
}

impl<T: Trace> Gc<T> {
    #[inline]
    pub fn as_ptr(self) -> *const T {
        unsafe { &self.ptr.as_ref().value as *const T }
    }

    #[inline]
    pub fn header(self) -> NonNull<GcHeader> {
        self.ptr.cast()
    }

    /// Reconstructs a typed handle from a header obtained from
    /// [`Gc::header`] on a `Gc<T>` of this same `T` -- used by callers that
    /// stash type-erased headers (e.g. a finalizer registry) and need the
    /// typed value back to run a `__gc` callback against it.
    ///
    /// # Safety
    /// `header` must prefix a `GcBox<T>` for this exact `T`; passing a
    /// header obtained from a `Gc<U>` of a different type is undefined
    /// behavior.
    #[inline]
    pub unsafe fn from_header(header: NonNull<GcHeader>) -> Self {
        Gc { ptr: header.cast() }
    }
}

impl<T: Trace> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Trace> Copy for Gc<T> {}

impl<T: Trace> std::ops::Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &self.ptr.as_ref().value }
    }
}

impl<T: Trace> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl<T: Trace> Eq for Gc<T> {}

/// A single heap-allocated object, type-erased behind its [`GcHeader`].
///
/// Roots registered with [`Heap::register_root`] are stored as this handle
/// rather than as a typed `Gc<T>` so the VM can keep one root list for
/// values of many different concrete types (stack slots, globals table,
/// open upvalues, ...).
pub type RootHandle = NonNull<GcHeader>;

/// Stop-the-world tracing mark-and-sweep heap.
///
/// `Heap` owns every object allocated through it; nothing is freed except
/// by [`Heap::sweep`]. It knows nothing about the concrete types it holds,
/// only that they implement [`Trace`] at allocation time -- the dispatch
/// needed to trace or drop them later is captured into function pointers
/// on the object's [`GcHeader`] once, at `alloc` time.
pub struct Heap {
    config: GcConfig,
    /// Intrusive singly linked list of every live (or not-yet-swept)
    /// object, head first.
    head: Cell<Option<NonNull<GcHeader>>>,
    /// Roots supplied by the embedder, e.g. stack slots and the globals
    /// table. The string pool is deliberately NOT registered here; see the
    /// module documentation.
    roots: RefCell<Vec<RootHandle>>,
    bytes_allocated: Cell<usize>,
    /// Allocation debt accumulated since the last cycle; compared against
    /// a threshold derived from `config.growth_factor` and the live bytes
    /// measured at the end of the previous cycle.
    debt: Cell<usize>,
    threshold: Cell<usize>,
    stats: GcStats,
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        Heap {
            threshold: Cell::new(config.initial_threshold),
            config,
            head: Cell::new(None),
            roots: RefCell::new(Vec::new()),
            bytes_allocated: Cell::new(0),
            debt: Cell::new(0),
            stats: GcStats::default(),
        }
    }

    /// Allocates `value` on the heap, returning a traced handle to it.
    ///
    /// This never triggers a collection itself; callers drive
    /// [`Heap::should_collect`] / [`Heap::mark_from_roots`] /
    /// [`Heap::sweep`] at a point in the VM loop where all live references
    /// are reachable from the stack (typically right before or after
    /// executing an instruction, never mid-expression-evaluation).
    pub fn alloc<T: Trace>(&self, value: T) -> Gc<T> {
        let size = std::mem::size_of::<GcBox<T>>();
        let gc_box = Box::new(GcBox {
            header: GcHeader {
                kind: 0,
                color: Cell::new(Color::White),
                next: Cell::new(self.head.get()),
                trace_fn: GcBox::<T>::trace_shim,
                drop_fn: GcBox::<T>::drop_shim,
                size,
            },
            value,
        });
        let ptr = NonNull::from(Box::leak(gc_box));
        self.head.set(Some(ptr.cast()));
        self.bytes_allocated.set(self.bytes_allocated.get() + size);
        self.debt.set(self.debt.get() + size);
        trace!(size, total = self.bytes_allocated.get(), "gc alloc");
        Gc { ptr }
    }

    /// Same as [`Heap::alloc`] but tags the header with a caller-defined
    /// kind, e.g. a discriminant identifying "this is a Lua string" versus
    /// "this is a Lua table" for diagnostics.
    pub fn alloc_kind<T: Trace>(&self, value: T, kind: u8) -> Gc<T> {
        let handle = self.alloc(value);
        unsafe { (*handle.ptr.as_ptr()).header.kind = kind };
        handle
    }

    /// Registers a root that must be traced on every cycle until
    /// unregistered. Used for long-lived anchors like the globals table;
    /// the VM's operand stack is walked directly rather than registered
    /// one slot at a time.
    pub fn register_root(&self, root: RootHandle) {
        self.roots.borrow_mut().push(root);
    }

    pub fn unregister_root(&self, root: RootHandle) -> Result<()> {
        let mut roots = self.roots.borrow_mut();
        let pos = roots
            .iter()
            .position(|r| *r == root)
            .ok_or_else(|| GcError::InvalidRoot(root.as_ptr() as usize))?;
        roots.swap_remove(pos);
        Ok(())
    }

    /// Whether accumulated allocation debt has crossed the threshold and a
    /// cycle should run before the next allocation.
    pub fn should_collect(&self) -> bool {
        self.debt.get() >= self.threshold.get()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.get()
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Marks every object reachable from the registered roots plus
    /// `extra_roots` (typically the live portion of the VM's operand stack,
    /// which changes every instruction and so isn't kept as a registered
    /// root). Returns the fully traced worklist result: all reachable
    /// objects are left [`Color::Black`].
    ///
    /// Does not free anything. Call [`Heap::sweep`] afterward, after giving
    /// any weak-reference structure (the string pool) a chance to drop its
    /// own white entries.
    pub fn mark_from_roots<I>(&self, extra_roots: I)
    where
        I: IntoIterator<Item = RootHandle>,
    {
        let mut worklist: Vec<NonNull<GcHeader>> = Vec::new();
        for root in self.roots.borrow().iter().copied() {
            push_gray(root, &mut worklist);
        }
        for root in extra_roots {
            push_gray(root, &mut worklist);
        }
        while let Some(ptr) = worklist.pop() {
            let header = unsafe { ptr.as_ref() };
            let trace_fn = header.trace_fn;
            unsafe { trace_fn(ptr, &mut worklist) };
            header.set_color(Color::Black);
        }
    }

    /// Frees every object still [`Color::White`], and resets every
    /// survivor back to white for the next cycle. Must run after
    /// [`Heap::mark_from_roots`] and after the caller has unlinked any weak
    /// references to about-to-be-freed objects.
    pub fn sweep(&self) {
        let mut survivors = 0usize;
        let mut freed = 0usize;
        let mut freed_bytes = 0usize;
        let mut cursor = self.head.get();
        let mut new_head: Option<NonNull<GcHeader>> = None;
        let mut tail: Option<NonNull<GcHeader>> = None;

        while let Some(ptr) = cursor {
            let header = unsafe { ptr.as_ref() };
            let next = header.next.get();
            cursor = next;

            if header.color() == Color::White {
                let drop_fn = header.drop_fn;
                freed_bytes += header.size();
                unsafe { drop_fn(ptr) };
                freed += 1;
                continue;
            }

            header.set_color(Color::White);
            header.next.set(None);
            survivors += 1;
            match tail {
                Some(t) => unsafe { t.as_ref() }.next.set(Some(ptr)),
                None => new_head = Some(ptr),
            }
            tail = Some(ptr);
        }

        self.head.set(new_head);
        self.bytes_allocated
            .set(self.bytes_allocated.get().saturating_sub(freed_bytes));
        self.debt.set(0);
        let live = self.bytes_allocated.get();
        self.threshold
            .set(((live as f64) * self.config.growth_factor) as usize + self.config.initial_threshold);
        self.stats.record_cycle(freed, freed_bytes, survivors);
        if self.config.log_cycles {
            debug!(freed, freed_bytes, survivors, next_threshold = self.threshold.get(), "gc cycle complete");
        }
    }

    /// Convenience for callers with no weak-reference bookkeeping to
    /// perform between mark and sweep: marks from `extra_roots` and sweeps
    /// immediately.
    pub fn collect<I>(&self, extra_roots: I)
    where
        I: IntoIterator<Item = RootHandle>,
    {
        self.mark_from_roots(extra_roots);
        self.sweep();
    }
}

fn push_gray(root: RootHandle, worklist: &mut Vec<NonNull<GcHeader>>) {
    let header = unsafe { root.as_ref() };
    if header.color() == Color::White {
        header.set_color(Color::Gray);
        worklist.push(root);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut cursor = self.head.get();
        while let Some(ptr) = cursor {
            let header = unsafe { ptr.as_ref() };
            let next = header.next.get();
            let drop_fn = header.drop_fn;
            unsafe { drop_fn(ptr) };
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    struct Node {
        child: StdRefCell<Option<Gc<Node>>>,
        _tag: u32,
    }

    impl Trace for Node {
        fn trace(&self, push: &mut dyn FnMut(NonNull<GcHeader>)) {
            if let Some(child) = *self.child.borrow() {
                push(child.header());
            }
        }
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node { child: StdRefCell::new(None), _tag: 1 });
        drop(a);
        heap.collect(std::iter::empty());
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn rooted_objects_survive() {
        let heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node { child: StdRefCell::new(None), _tag: 2 });
        heap.collect(vec![a.header()]);
        assert!(heap.bytes_allocated() > 0);
    }

    #[test]
    fn reachable_via_child_edge_survives() {
        let heap = Heap::new(GcConfig::default());
        let child = heap.alloc(Node { child: StdRefCell::new(None), _tag: 3 });
        let parent = heap.alloc(Node {
            child: StdRefCell::new(Some(child)),
            _tag: 4,
        });
        heap.collect(vec![parent.header()]);
        assert!(heap.bytes_allocated() > 0);
    }
}
