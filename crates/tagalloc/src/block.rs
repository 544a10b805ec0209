//! Boundary-tag encoding of blocks inside the arena.
//!
//! Every block starts with a one-word header. Free blocks additionally carry
//! two free-list links right after the header and a footer in their last
//! word; allocated blocks hand everything after the header to the caller.
//!
//! ```text
//! Allocated block:                 Free block:
//! ┌────────────────────┐           ┌────────────────────┐
//! │ header             │           │ header             │
//! ├────────────────────┤ ◀─ payload├────────────────────┤
//! │                    │           │ prev link          │
//! │ payload            │           │ next link          │
//! │ (size - 1 word)    │           │ ...                │
//! │                    │           ├────────────────────┤
//! │                    │           │ footer             │
//! └────────────────────┘           └────────────────────┘
//! ```
//!
//! The header packs the block size (a multiple of [`ALIGNMENT`]) with two
//! flags: whether the block itself is allocated, and whether its physical
//! predecessor is. Because of the second flag, the word in front of a header
//! is only ever read as a footer when the predecessor is known to be free.
//!
//! The arena begins with the free-list sentinel and ends with an epilogue
//! header:
//!
//! ```text
//! offset 0          8        16       24                         end - 8
//! ┌────────┬────────┬────────┬────────────── ··· ───────────────┬──────────┐
//! │sentinel│ prev   │ next   │ blocks                           │ epilogue │
//! │ 0 | A  │        │        │                                  │ 0 | A    │
//! └────────┴────────┴────────┴────────────── ··· ───────────────┴──────────┘
//! ```

use core::{iter::FusedIterator, ptr::NonNull};

use bitflags::bitflags;

/// Size of a header, footer or free-list link.
pub(crate) const WORD_SIZE: usize = size_of::<usize>();

/// Alignment of every payload and granularity of every block size.
pub const ALIGNMENT: usize = 16;

/// Smallest block able to hold a header, two links and a footer.
pub const MIN_BLOCK_SIZE: usize = {
    let size = 4 * WORD_SIZE;
    if size < ALIGNMENT { ALIGNMENT } else { size }
};

/// Bytes of metadata an allocated block spends on top of its payload.
pub const OVERHEAD: usize = WORD_SIZE;

/// The free-list root. Its header encodes size zero.
pub(crate) const SENTINEL: Block = Block(0);

/// The first ordinary block, right after the sentinel and its two links.
pub(crate) const FIRST_BLOCK: Block = Block(3 * WORD_SIZE);

/// Arena bytes needed before any ordinary block exists: the sentinel plus
/// the epilogue header.
pub(crate) const PROLOGUE_SIZE: usize = FIRST_BLOCK.0 + WORD_SIZE;

const SIZE_MASK: usize = !(ALIGNMENT - 1);

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!((FIRST_BLOCK.0 + OVERHEAD) % ALIGNMENT == 0);
const _: () = assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);

bitflags! {
    /// Flag bits stored in the low bits of a header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TagFlags: usize {
        /// The block is owned by a caller.
        const ALLOCATED = 1 << 0;

        /// The physically preceding block is allocated (or is the sentinel).
        ///
        /// Only headers carry this bit; footers leave it clear.
        const PREV_ALLOCATED = 1 << 1;
    }
}

/// A packed header or footer word.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag(usize);

impl Tag {
    pub(crate) fn new(size: usize, flags: TagFlags) -> Self {
        debug_assert_eq!(size & !SIZE_MASK, 0, "block size must be aligned");
        Self(size | flags.bits())
    }

    pub(crate) fn bits(self) -> usize {
        self.0
    }

    pub(crate) fn size(self) -> usize {
        self.0 & SIZE_MASK
    }

    pub(crate) fn flags(self) -> TagFlags {
        TagFlags::from_bits_truncate(self.0)
    }

    pub(crate) fn is_allocated(self) -> bool {
        self.flags().contains(TagFlags::ALLOCATED)
    }

    pub(crate) fn is_prev_allocated(self) -> bool {
        self.flags().contains(TagFlags::PREV_ALLOCATED)
    }

    /// Whether bits below the alignment other than the flags are set, which
    /// means the stored size was never a multiple of [`ALIGNMENT`].
    pub(crate) fn has_stray_bits(self) -> bool {
        self.0 & !SIZE_MASK & !TagFlags::all().bits() != 0
    }

    /// The footer mirroring this header: same size and allocation flag.
    pub(crate) fn footer(self) -> Self {
        Self(self.0 & (SIZE_MASK | TagFlags::ALLOCATED.bits()))
    }
}

/// A block, identified by the offset of its header from the arena origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Block(pub(crate) usize);

impl Block {
    pub(crate) fn offset(self) -> usize {
        self.0
    }
}

/// A read-only description of one physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header.
    pub addr: usize,
    /// Total block size, metadata included.
    pub size: usize,
    pub allocated: bool,
}

impl BlockInfo {
    /// Address of the first payload byte.
    #[must_use]
    pub fn payload_addr(&self) -> usize {
        self.addr + OVERHEAD
    }

    /// Bytes a caller may use in this block while it is allocated.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.size - OVERHEAD
    }
}

/// The formatted part of the arena, addressed by offsets from its origin.
///
/// All metadata reads and writes go through raw pointers; no reference to
/// arena memory is ever created, so caller-held payload pointers and the
/// allocator's view of the same bytes never alias a Rust reference.
pub(crate) struct RawHeap {
    origin: NonNull<u8>,
    end: usize,
    pub(crate) free_blocks: usize,
}

unsafe impl Send for RawHeap {}

impl RawHeap {
    /// Formats the sentinel and an empty block sequence at `origin`.
    ///
    /// # Safety
    ///
    /// `origin..origin + PROLOGUE_SIZE` must be valid for reads and writes,
    /// aligned to [`ALIGNMENT`], and exclusively owned by the returned value.
    pub(crate) unsafe fn init(origin: NonNull<u8>) -> Self {
        assert!(origin.addr().get().is_multiple_of(ALIGNMENT));
        let mut heap = Self {
            origin,
            end: PROLOGUE_SIZE,
            free_blocks: 0,
        };
        heap.write_header(SENTINEL, Tag::new(0, TagFlags::ALLOCATED));
        heap.init_free_list();
        heap.write_header(
            heap.epilogue(),
            Tag::new(0, TagFlags::ALLOCATED | TagFlags::PREV_ALLOCATED),
        );
        heap
    }

    #[expect(clippy::cast_ptr_alignment)]
    fn word_ptr(&self, offset: usize) -> *mut usize {
        debug_assert!(
            offset + WORD_SIZE <= self.end,
            "word {offset:#x} is outside the heap"
        );
        debug_assert!(offset.is_multiple_of(WORD_SIZE));
        unsafe { self.origin.as_ptr().add(offset) }.cast::<usize>()
    }

    pub(crate) fn read_word(&self, offset: usize) -> usize {
        unsafe { self.word_ptr(offset).read() }
    }

    pub(crate) fn write_word(&mut self, offset: usize, value: usize) {
        unsafe { self.word_ptr(offset).write(value) }
    }

    pub(crate) fn origin_addr(&self) -> usize {
        self.origin.addr().get()
    }

    /// Offset one past the epilogue header.
    pub(crate) fn end(&self) -> usize {
        self.end
    }

    pub(crate) fn epilogue(&self) -> Block {
        Block(self.end - WORD_SIZE)
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free_blocks
    }

    pub(crate) fn address(&self, block: Block) -> usize {
        self.origin_addr() + block.0
    }

    pub(crate) fn header(&self, block: Block) -> Tag {
        Tag(self.read_word(block.0))
    }

    pub(crate) fn write_header(&mut self, block: Block, tag: Tag) {
        self.write_word(block.0, tag.bits());
    }

    /// Reads the last word of `block`, which is only a footer while the
    /// block is free.
    pub(crate) fn footer(&self, block: Block) -> Tag {
        Tag(self.read_word(block.0 + self.size(block) - WORD_SIZE))
    }

    pub(crate) fn size(&self, block: Block) -> usize {
        self.header(block).size()
    }

    pub(crate) fn is_allocated(&self, block: Block) -> bool {
        self.header(block).is_allocated()
    }

    /// Writes a complete header (and a footer when free) for a block whose
    /// previous contents are meaningless.
    pub(crate) fn format(&mut self, block: Block, size: usize, flags: TagFlags) {
        let tag = Tag::new(size, flags);
        self.write_header(block, tag);
        if !tag.is_allocated() {
            self.write_word(block.0 + size - WORD_SIZE, tag.footer().bits());
        }
    }

    /// Rewrites size and allocation state, keeping the predecessor bit.
    pub(crate) fn write_block(&mut self, block: Block, size: usize, allocated: bool) {
        let mut flags = self.header(block).flags() & TagFlags::PREV_ALLOCATED;
        flags.set(TagFlags::ALLOCATED, allocated);
        self.format(block, size, flags);
    }

    pub(crate) fn set_prev_allocated(&mut self, block: Block, prev_allocated: bool) {
        let header = self.header(block);
        let mut flags = header.flags();
        flags.set(TagFlags::PREV_ALLOCATED, prev_allocated);
        self.write_header(block, Tag::new(header.size(), flags));
    }

    /// The physically following block (possibly the epilogue).
    pub(crate) fn next(&self, block: Block) -> Block {
        Block(block.0 + self.size(block))
    }

    /// The physically preceding block, if it exists and is free.
    ///
    /// An allocated predecessor has no footer, so it cannot be located and
    /// `None` is returned; the same goes for the first block of the arena.
    pub(crate) fn prev_free(&self, block: Block) -> Option<Block> {
        if block <= FIRST_BLOCK || self.header(block).is_prev_allocated() {
            return None;
        }
        let size = Tag(self.read_word(block.0 - WORD_SIZE)).size();
        let prev = block.0.checked_sub(size)?;
        (prev >= FIRST_BLOCK.0).then_some(Block(prev))
    }

    pub(crate) fn payload(&self, block: Block) -> NonNull<u8> {
        unsafe { self.origin.add(block.0 + OVERHEAD) }
    }

    pub(crate) fn payload_size(&self, block: Block) -> usize {
        self.size(block) - OVERHEAD
    }

    /// Recovers the block owning a payload pointer.
    pub(crate) fn block_of(&self, payload: NonNull<u8>) -> Block {
        let offset = payload.addr().get() - self.origin_addr();
        debug_assert!(offset >= FIRST_BLOCK.0 + OVERHEAD && offset < self.end);
        Block(offset - OVERHEAD)
    }

    /// Appends `size` freshly grown bytes to the block sequence.
    ///
    /// The old epilogue header becomes the header of a new free block
    /// spanning the grown region, and a new epilogue is written at the end.
    /// The new block is not linked into the free list.
    pub(crate) fn append(&mut self, size: usize) -> Block {
        debug_assert!(size.is_multiple_of(ALIGNMENT) && size >= MIN_BLOCK_SIZE);
        let block = self.epilogue();
        let prev_flag = self.header(block).flags() & TagFlags::PREV_ALLOCATED;
        self.end += size;
        self.format(block, size, prev_flag);
        let epilogue = self.epilogue();
        self.write_header(epilogue, Tag::new(0, TagFlags::ALLOCATED));
        block
    }

    pub(crate) fn info(&self, block: Block) -> BlockInfo {
        let header = self.header(block);
        BlockInfo {
            addr: self.address(block),
            size: header.size(),
            allocated: header.is_allocated(),
        }
    }

    pub(crate) fn blocks(&self) -> Blocks<'_> {
        Blocks {
            heap: self,
            cursor: FIRST_BLOCK,
        }
    }
}

/// Iterator over the physical blocks of a heap, in address order.
pub struct Blocks<'a> {
    heap: &'a RawHeap,
    cursor: Block,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.heap.epilogue() {
            return None;
        }
        let info = self.heap.info(self.cursor);
        if info.size == 0 {
            // corrupted header; stop rather than loop forever
            self.cursor = self.heap.epilogue();
            return None;
        }
        self.cursor = self.heap.next(self.cursor);
        Some(info)
    }
}

impl FusedIterator for Blocks<'_> {}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use super::*;

    #[test]
    fn test_tag_packing() {
        let tag = Tag::new(48, TagFlags::ALLOCATED | TagFlags::PREV_ALLOCATED);
        assert_eq!(tag.size(), 48);
        assert!(tag.is_allocated());
        assert!(tag.is_prev_allocated());

        let footer = tag.footer();
        assert_eq!(footer.size(), 48);
        assert!(footer.is_allocated());
        assert!(!footer.is_prev_allocated());

        let free = Tag::new(4096, TagFlags::empty());
        assert_eq!(free.size(), 4096);
        assert!(!free.is_allocated());
        assert_eq!(free.footer(), free);
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(MIN_BLOCK_SIZE % ALIGNMENT, 0);
        assert!(MIN_BLOCK_SIZE >= 4 * WORD_SIZE);
        assert_eq!((FIRST_BLOCK.offset() + OVERHEAD) % ALIGNMENT, 0);
        assert_eq!(PROLOGUE_SIZE, FIRST_BLOCK.offset() + WORD_SIZE);
    }

    #[repr(C, align(16))]
    struct Buffer([u8; 512]);

    fn with_raw_heap<F>(test_fn: F)
    where
        F: FnOnce(&mut RawHeap),
    {
        let mut buffer = Buffer([0x11; 512]);
        let origin = NonNull::from(&mut buffer.0).cast::<u8>();
        let mut heap = unsafe { RawHeap::init(origin) };
        test_fn(&mut heap);
    }

    #[test]
    fn test_init_writes_sentinel_and_epilogue() {
        with_raw_heap(|heap| {
            assert_eq!(heap.size(SENTINEL), 0);
            assert!(heap.is_allocated(SENTINEL));
            assert_eq!(heap.epilogue(), FIRST_BLOCK);
            assert!(heap.is_allocated(heap.epilogue()));
            assert!(heap.header(heap.epilogue()).is_prev_allocated());
            assert_eq!(heap.blocks().count(), 0);
        });
    }

    #[test]
    fn test_append_reuses_epilogue() {
        with_raw_heap(|heap| {
            let block = heap.append(128);
            assert_eq!(block, FIRST_BLOCK);
            assert_eq!(heap.size(block), 128);
            assert!(!heap.is_allocated(block));
            assert!(heap.header(block).is_prev_allocated());
            assert_eq!(heap.footer(block), heap.header(block).footer());
            assert_eq!(heap.next(block), heap.epilogue());
            assert!(!heap.header(heap.epilogue()).is_prev_allocated());
            assert_eq!(heap.payload(block).addr().get() % ALIGNMENT, 0);
        });
    }

    #[test]
    fn test_physical_neighbours() {
        with_raw_heap(|heap| {
            let first = heap.append(64);
            heap.write_block(first, 64, true);
            let epilogue = heap.next(first);
            heap.set_prev_allocated(epilogue, true);

            let second = heap.append(96);
            assert_eq!(heap.next(first), second);
            assert!(heap.header(second).is_prev_allocated());
            assert_eq!(heap.prev_free(second), None);

            heap.write_block(first, 64, false);
            heap.set_prev_allocated(second, false);
            assert_eq!(heap.prev_free(second), Some(first));
            assert_eq!(heap.prev_free(first), None);
        });
    }

    #[test]
    fn test_payload_round_trip() {
        with_raw_heap(|heap| {
            let block = heap.append(64);
            let payload = heap.payload(block);
            assert_eq!(heap.block_of(payload), block);
            assert_eq!(heap.payload_size(block), 64 - OVERHEAD);
        });
    }

    #[test]
    fn test_blocks_iterates_in_address_order() {
        with_raw_heap(|heap| {
            let first = heap.append(64);
            heap.write_block(first, 32, true);
            heap.format(
                Block(first.offset() + 32),
                32,
                TagFlags::PREV_ALLOCATED,
            );
            let infos = heap.blocks().collect::<Vec<_>>();
            assert_eq!(infos.len(), 2);
            assert_eq!(infos[0].size, 32);
            assert!(infos[0].allocated);
            assert_eq!(infos[1].addr, infos[0].addr + 32);
            assert!(!infos[1].allocated);
        });
    }
}
