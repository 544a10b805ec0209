//! The allocator facade: `allocate`, `release`, `reallocate` and `callocate`
//! over one arena.

use core::{cmp, ptr, ptr::NonNull};

use snafu::{OptionExt as _, ensure};

use crate::{
    arena::ArenaSource,
    block::{ALIGNMENT, BlockInfo, Blocks, MIN_BLOCK_SIZE, OVERHEAD, PROLOGUE_SIZE, RawHeap},
    check::CheckError,
    error::{ArenaExhaustedSnafu, HeapError, MisalignedArenaSnafu},
    free_list::FreeBlocks,
};

/// Tuning knobs for a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Minimum number of bytes requested from the arena when no free block
    /// fits. Larger requests grow the arena by exactly what they need.
    pub growth_chunk: usize,
    /// Bytes requested from the arena when the heap is created, formatted as
    /// one free block. Zero leaves the heap empty until the first request.
    pub initial_chunk: usize,
}

impl HeapConfig {
    pub const DEFAULT_CHUNK: usize = 1 << 12;
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            growth_chunk: Self::DEFAULT_CHUNK,
            initial_chunk: Self::DEFAULT_CHUNK,
        }
    }
}

/// Summary of a heap's block population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes obtained from the arena source, sentinel and epilogue included.
    pub arena_size: usize,
    pub allocated_blocks: usize,
    /// Bytes held by allocated blocks, headers included.
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
}

/// A boundary-tag allocator with an explicit, first-fit free list.
///
/// All state lives inside the arena supplied at construction; the `Heap`
/// value itself only remembers where the arena starts and ends. Independent
/// heaps over independent arenas do not interact.
///
/// A `Heap` is not synchronized. Wrap it in
/// [`LockedHeap`](crate::LockedHeap) to share it.
pub struct Heap<A> {
    arena: A,
    raw: RawHeap,
    config: HeapConfig,
}

/// Block size needed to serve a `size`-byte request.
fn adjusted_size(size: usize) -> Option<usize> {
    let size = size.checked_add(OVERHEAD)?.checked_next_multiple_of(ALIGNMENT)?;
    Some(cmp::max(size, MIN_BLOCK_SIZE))
}

impl<A> Heap<A>
where
    A: ArenaSource,
{
    /// Creates a heap with the default [`HeapConfig`].
    #[track_caller]
    pub fn new(arena: A) -> Result<Self, HeapError> {
        Self::with_config(arena, HeapConfig::default())
    }

    /// Formats the sentinel at the arena's current break and grows the heap
    /// by `config.initial_chunk`.
    ///
    /// The arena must be fresh or at least have its break aligned to 16
    /// bytes; everything below the break is left alone.
    #[track_caller]
    pub fn with_config(mut arena: A, config: HeapConfig) -> Result<Self, HeapError> {
        let origin = arena.grow(PROLOGUE_SIZE).context(ArenaExhaustedSnafu {
            requested: PROLOGUE_SIZE,
        })?;
        let addr = origin.addr().get();
        ensure!(
            addr.is_multiple_of(ALIGNMENT),
            MisalignedArenaSnafu { addr }
        );

        let raw = unsafe { RawHeap::init(origin) };
        let mut heap = Self { arena, raw, config };
        if config.initial_chunk > 0 {
            heap.extend(config.initial_chunk)
                .context(ArenaExhaustedSnafu {
                    requested: config.initial_chunk,
                })?;
        }
        debug_check(&heap.raw);
        Ok(heap)
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Allocates a block with at least `size` usable bytes.
    ///
    /// The returned pointer is aligned to 16 bytes. Returns `None` when
    /// `size` is zero or the arena cannot grow.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let asize = adjusted_size(size)?;

        let block = match self.raw.find_fit(asize) {
            Some(block) => block,
            None => {
                self.extend(cmp::max(asize, self.config.growth_chunk))?;
                self.raw.find_fit(asize)?
            }
        };
        self.raw.place(block, asize);
        debug_check(&self.raw);
        Some(self.raw.payload(block))
    }

    /// Returns a block to the heap, merging it with free neighbours.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate),
    /// [`reallocate`](Self::reallocate) or [`callocate`](Self::callocate) on
    /// this heap and not released since. Violations are not detected and
    /// corrupt the heap.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let block = self.raw.block_of(ptr);
        let size = self.raw.size(block);
        self.raw.write_block(block, size, false);
        let next = self.raw.next(block);
        self.raw.set_prev_allocated(next, false);
        self.raw.coalesce(block);
        debug_check(&self.raw);
    }

    /// Resizes an allocation by moving it.
    ///
    /// - `size == 0` releases `ptr` (if any) and returns `None`.
    /// - `ptr == None` is the same as [`allocate`](Self::allocate).
    /// - Otherwise a new block is always allocated, the first
    ///   `min(size, old usable size)` bytes are copied, and the old block is
    ///   released. If the new allocation fails, the old block is left as it
    ///   was and `None` is returned.
    ///
    /// # Safety
    ///
    /// `ptr`, if present, must satisfy the contract of
    /// [`release`](Self::release).
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let Some(old) = ptr else {
            return self.allocate(size);
        };
        if size == 0 {
            unsafe { self.release(old) };
            return None;
        }

        let old_size = self.raw.payload_size(self.raw.block_of(old));
        let new = self.allocate(size)?;
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), cmp::min(size, old_size));
            self.release(old);
        }
        Some(new)
    }

    /// Allocates a zero-filled array of `count` elements of `size` bytes.
    ///
    /// Returns `None` without allocating when `count * size` overflows. A
    /// zero total still yields a valid, minimum-size block.
    pub fn callocate(&mut self, count: usize, size: usize) -> Option<NonNull<u8>> {
        let total = count.checked_mul(size)?;
        let ptr = self.allocate(cmp::max(total, 1))?;
        let len = self.raw.payload_size(self.raw.block_of(ptr));
        unsafe { ptr.write_bytes(0, len) };
        Some(ptr)
    }

    /// Number of bytes the caller may use behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap.
    #[must_use]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.raw.payload_size(self.raw.block_of(ptr))
    }

    /// Validates every block and the free list.
    ///
    /// The error records the caller's location.
    #[track_caller]
    pub fn check_heap(&self) -> Result<(), CheckError> {
        self.raw.check()
    }

    /// Physical blocks in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        self.raw.blocks()
    }

    /// Free blocks in free-list order, which is the order first fit tries
    /// them.
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        self.raw.free_blocks()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena_size: self.raw.end(),
            ..HeapStats::default()
        };
        for BlockInfo {
            size, allocated, ..
        } in self.blocks()
        {
            if allocated {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += size;
            }
        }
        stats
    }

    /// Grows the arena by at least `size` bytes and lists the new space,
    /// merged with the last block if that one was free.
    fn extend(&mut self, size: usize) -> Option<()> {
        let size = cmp::max(size.checked_next_multiple_of(ALIGNMENT)?, MIN_BLOCK_SIZE);
        let brk = self.arena.grow(size)?;
        debug_assert_eq!(
            brk.addr().get(),
            self.raw.origin_addr() + self.raw.end(),
            "arena growth must be contiguous"
        );
        let block = self.raw.append(size);
        self.raw.coalesce(block);
        Some(())
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "debug-check")] {
        #[track_caller]
        fn debug_check(raw: &RawHeap) {
            if let Err(err) = raw.check() {
                panic!("heap consistency check failed: {err}");
            }
        }
    } else {
        #[inline]
        fn debug_check(_raw: &RawHeap) {}
    }
}
