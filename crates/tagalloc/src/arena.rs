//! Sources of contiguous, monotonically growing memory.
//!
//! A [`Heap`](crate::Heap) never talks to the operating system directly. It
//! asks an [`ArenaSource`] for more bytes, sbrk-style, and assumes that every
//! byte range handed out follows the previous one without a gap.
//!
//! ```text
//!  low_address()                  high_address()              capacity
//!  │                              │                           │
//!  ▼                              ▼                           ▼
//!  ┌──────────────────────────────┬───────────────────────────┐
//!  │   bytes owned by the heap    │   not yet handed out      │
//!  └──────────────────────────────┴───────────────────────────┘
//!                                 ◀── grow(n) moves this ──▶
//! ```

use core::{marker::PhantomData, ptr::NonNull};

#[cfg(feature = "alloc")]
pub use self::reserved::{ArenaError, ReservedArena};
use crate::block::ALIGNMENT;

/// A growable, contiguous byte range.
///
/// # Contract
///
/// - `grow(n)` returns the previous high address and extends the range by
///   exactly `n` bytes, or returns `None` and leaves the range unchanged.
/// - Successive successful calls return adjacent ranges.
/// - Memory handed out stays valid and in place until the source is dropped.
pub trait ArenaSource {
    /// Extends the arena by `bytes`, returning the start of the new range.
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>>;

    /// Address of the first byte of the arena.
    fn low_address(&self) -> usize;

    /// Address one past the last byte handed out so far.
    fn high_address(&self) -> usize;

    /// Number of bytes handed out so far.
    fn size(&self) -> usize {
        self.high_address() - self.low_address()
    }
}

/// An arena carved out of a caller-provided buffer.
///
/// The start of the buffer is rounded up to the allocator's alignment, so up
/// to 15 leading bytes may go unused.
pub struct SliceArena<'a> {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
    _buffer: PhantomData<&'a mut [u8]>,
}

unsafe impl Send for SliceArena<'_> {}

impl<'a> SliceArena<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        let len = buffer.len();
        let start = NonNull::from(buffer).cast::<u8>();
        let offset = start.align_offset(ALIGNMENT);
        if offset > len {
            return Self {
                base: start,
                capacity: 0,
                brk: 0,
                _buffer: PhantomData,
            };
        }
        Self {
            base: unsafe { start.add(offset) },
            capacity: len - offset,
            brk: 0,
            _buffer: PhantomData,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl ArenaSource for SliceArena<'_> {
    fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let new_brk = self.brk.checked_add(bytes)?;
        if new_brk > self.capacity {
            return None;
        }
        let old = unsafe { self.base.add(self.brk) };
        self.brk = new_brk;
        Some(old)
    }

    fn low_address(&self) -> usize {
        self.base.addr().get()
    }

    fn high_address(&self) -> usize {
        self.low_address() + self.brk
    }
}

#[cfg(feature = "alloc")]
mod reserved {
    extern crate alloc;

    use core::{alloc::Layout, ptr::NonNull};

    use snafu::{OptionExt as _, ResultExt as _, Snafu};

    use self::arena_error::{InvalidCapacitySnafu, ReserveSnafu};
    use super::ArenaSource;
    use crate::{block::ALIGNMENT, error::Location};

    #[derive(Debug, Snafu)]
    #[snafu(module)]
    pub enum ArenaError {
        #[snafu(display("invalid arena capacity: {capacity} bytes"))]
        InvalidCapacity {
            capacity: usize,
            #[snafu(implicit)]
            location: Location,
            #[snafu(source)]
            source: core::alloc::LayoutError,
        },
        #[snafu(display("failed to reserve {capacity} bytes for the arena"))]
        Reserve {
            capacity: usize,
            #[snafu(implicit)]
            location: Location,
        },
    }

    impl ArenaError {
        #[must_use]
        pub fn location(&self) -> Location {
            match self {
                Self::InvalidCapacity { location, .. } | Self::Reserve { location, .. } => {
                    *location
                }
            }
        }
    }

    /// An arena whose whole capacity is reserved from the global allocator
    /// when it is created.
    ///
    /// Growth only moves a break offset inside the reservation, so the arena
    /// never relocates. Growing past the capacity fails.
    pub struct ReservedArena {
        base: NonNull<u8>,
        layout: Layout,
        brk: usize,
    }

    unsafe impl Send for ReservedArena {}

    impl ReservedArena {
        /// Capacity used by [`with_default_capacity`](Self::with_default_capacity).
        pub const DEFAULT_CAPACITY: usize = 20 * (1 << 20);

        #[track_caller]
        pub fn new(capacity: usize) -> Result<Self, ArenaError> {
            let layout = Layout::from_size_align(capacity.max(ALIGNMENT), ALIGNMENT)
                .context(InvalidCapacitySnafu { capacity })?;
            let base = NonNull::new(unsafe { alloc::alloc::alloc(layout) })
                .context(ReserveSnafu { capacity })?;
            Ok(Self {
                base,
                layout,
                brk: 0,
            })
        }

        #[track_caller]
        pub fn with_default_capacity() -> Result<Self, ArenaError> {
            Self::new(Self::DEFAULT_CAPACITY)
        }

        #[must_use]
        pub fn capacity(&self) -> usize {
            self.layout.size()
        }
    }

    impl ArenaSource for ReservedArena {
        fn grow(&mut self, bytes: usize) -> Option<NonNull<u8>> {
            let new_brk = self.brk.checked_add(bytes)?;
            if new_brk > self.layout.size() {
                return None;
            }
            let old = unsafe { self.base.add(self.brk) };
            self.brk = new_brk;
            Some(old)
        }

        fn low_address(&self) -> usize {
            self.base.addr().get()
        }

        fn high_address(&self) -> usize {
            self.low_address() + self.brk
        }
    }

    impl Drop for ReservedArena {
        fn drop(&mut self) {
            unsafe { alloc::alloc::dealloc(self.base.as_ptr(), self.layout) }
        }
    }
}
