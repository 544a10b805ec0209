//! A spin-locked heap that can serve as the global allocator.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::NonNull,
};

use snafu::ensure;
use spin::Mutex;

use crate::{
    arena::ArenaSource,
    block::ALIGNMENT,
    error::{AlreadyInitializedSnafu, HeapError},
    heap::{Heap, HeapConfig},
};

/// A [`Heap`] behind a spin lock, usable as a `#[global_allocator]`.
///
/// The heap is created lazily by [`init`](Self::init), so a `LockedHeap` can
/// live in a `static`. Until then every allocation fails.
///
/// ```rust
/// use core::alloc::{GlobalAlloc as _, Layout};
///
/// use tagalloc::{LockedHeap, ReservedArena};
///
/// static HEAP: LockedHeap<ReservedArena> = LockedHeap::new();
///
/// HEAP.init(ReservedArena::new(1 << 16).unwrap()).unwrap();
/// let layout = Layout::from_size_align(48, 8).unwrap();
/// unsafe {
///     let ptr = HEAP.alloc(layout);
///     assert!(!ptr.is_null());
///     HEAP.dealloc(ptr, layout);
/// }
/// ```
///
/// Layouts aligned to more than [`ALIGNMENT`] bytes cannot be served; the
/// allocation fails instead.
pub struct LockedHeap<A> {
    heap: Mutex<Option<Heap<A>>>,
}

impl<A> LockedHeap<A> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.heap.lock().is_some()
    }
}

impl<A> Default for LockedHeap<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> LockedHeap<A>
where
    A: ArenaSource,
{
    #[track_caller]
    pub fn init(&self, arena: A) -> Result<(), HeapError> {
        self.init_with_config(arena, HeapConfig::default())
    }

    /// Builds the heap over `arena`.
    ///
    /// Fails with [`HeapError::AlreadyInitialized`] if a heap is already in
    /// place; the existing heap is kept and `arena` is dropped.
    #[track_caller]
    pub fn init_with_config(&self, arena: A, config: HeapConfig) -> Result<(), HeapError> {
        let mut heap = self.heap.lock();
        ensure!(heap.is_none(), AlreadyInitializedSnafu);
        *heap = Some(Heap::with_config(arena, config)?);
        Ok(())
    }

    /// Runs `f` on the heap with the lock held.
    ///
    /// Returns `None` if the heap has not been initialized. `f` must not
    /// allocate through this same `LockedHeap`, or it deadlocks.
    pub fn with<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Heap<A>) -> R,
    {
        self.heap.lock().as_mut().map(f)
    }
}

unsafe impl<A> GlobalAlloc for LockedHeap<A>
where
    A: ArenaSource + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return core::ptr::null_mut();
        }
        self.with(|heap| heap.allocate(layout.size()))
            .flatten()
            .map(NonNull::as_ptr)
            .unwrap_or_default()
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        self.with(|heap| unsafe { heap.release(ptr) });
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return core::ptr::null_mut();
        }
        self.with(|heap| heap.callocate(1, layout.size()))
            .flatten()
            .map(NonNull::as_ptr)
            .unwrap_or_default()
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return core::ptr::null_mut();
        }
        self.with(|heap| unsafe { heap.reallocate(NonNull::new(ptr), new_size) })
            .flatten()
            .map(NonNull::as_ptr)
            .unwrap_or_default()
    }
}
