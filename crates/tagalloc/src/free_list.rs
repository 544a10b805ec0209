//! Circular doubly linked list of free blocks.
//!
//! The list is threaded through the free blocks themselves: the two words
//! after a free block's header hold the offsets of its neighbours in the
//! list. The sentinel at offset zero closes the circle, so an empty list is
//! the sentinel pointing at itself.
//!
//! ```text
//!        ┌──────────────────────────────────────────────────┐
//!        ▼                                                  │
//!   ┌──────────┐ next ┌─────────┐ next ┌─────────┐ next     │
//!   │ sentinel │─────▶│ oldest  │─────▶│ newest  │──────────┘
//!   │ size 0   │◀─────│         │◀─────│         │
//!   └──────────┘ prev └─────────┘ prev └─────────┘
//!        │                                   ▲
//!        └──────────────── prev ─────────────┘
//! ```
//!
//! New blocks are appended at the tail, and [`RawHeap::first_fit`] walks
//! from the head, so ties between equally suitable blocks go to the one that
//! was freed (or created) first.

use core::iter::FusedIterator;

use crate::block::{Block, BlockInfo, RawHeap, SENTINEL, WORD_SIZE};

const PREV_LINK: usize = WORD_SIZE;
const NEXT_LINK: usize = 2 * WORD_SIZE;

impl RawHeap {
    pub(crate) fn prev_link(&self, block: Block) -> Block {
        Block(self.read_word(block.offset() + PREV_LINK))
    }

    pub(crate) fn next_link(&self, block: Block) -> Block {
        Block(self.read_word(block.offset() + NEXT_LINK))
    }

    fn set_prev_link(&mut self, block: Block, prev: Block) {
        self.write_word(block.offset() + PREV_LINK, prev.offset());
    }

    fn set_next_link(&mut self, block: Block, next: Block) {
        self.write_word(block.offset() + NEXT_LINK, next.offset());
    }

    pub(crate) fn init_free_list(&mut self) {
        self.set_prev_link(SENTINEL, SENTINEL);
        self.set_next_link(SENTINEL, SENTINEL);
        self.free_blocks = 0;
    }

    /// Appends `block` at the tail of the list.
    ///
    /// `block` must be formatted as free and must not already be listed.
    pub(crate) fn insert(&mut self, block: Block) {
        debug_assert!(!self.is_allocated(block), "only free blocks are listed");
        debug_assert_ne!(block, SENTINEL);

        let tail = self.prev_link(SENTINEL);
        self.set_next_link(tail, block);
        self.set_prev_link(block, tail);
        self.set_next_link(block, SENTINEL);
        self.set_prev_link(SENTINEL, block);
        self.free_blocks += 1;
    }

    /// Unlinks `block` using only its own links.
    ///
    /// `block` must currently be listed.
    pub(crate) fn remove(&mut self, block: Block) {
        debug_assert_ne!(block, SENTINEL);
        debug_assert!(self.free_blocks > 0);

        let prev = self.prev_link(block);
        let next = self.next_link(block);
        self.set_next_link(prev, next);
        self.set_prev_link(next, prev);
        self.free_blocks -= 1;
    }

    /// Returns the first listed block of at least `min_size` bytes.
    ///
    /// The walk ends when it comes back to the sentinel, recognised by its
    /// zero size.
    pub(crate) fn first_fit(&self, min_size: usize) -> Option<Block> {
        let mut block = self.next_link(SENTINEL);
        loop {
            let size = self.size(block);
            if size == 0 {
                return None;
            }
            if size >= min_size {
                return Some(block);
            }
            block = self.next_link(block);
        }
    }

    pub(crate) fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks {
            heap: self,
            cursor: self.next_link(SENTINEL),
            remaining: self.free_blocks,
        }
    }
}

/// Iterator over the free list, in list order.
pub struct FreeBlocks<'a> {
    heap: &'a RawHeap,
    cursor: Block,
    remaining: usize,
}

impl Iterator for FreeBlocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.cursor == SENTINEL {
            return None;
        }
        let info = self.heap.info(self.cursor);
        self.cursor = self.heap.next_link(self.cursor);
        self.remaining -= 1;
        Some(info)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

impl FusedIterator for FreeBlocks<'_> {}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;
    use core::ptr::NonNull;

    use super::*;
    use crate::block::{FIRST_BLOCK, TagFlags};

    #[repr(C, align(16))]
    struct Buffer([u8; 1024]);

    /// Builds a heap holding free blocks of the given sizes, physically in
    /// order but separated by 32-byte allocated spacers so none touch.
    fn with_free_blocks<F>(sizes: &[usize], test_fn: F)
    where
        F: FnOnce(&mut RawHeap, &[Block]),
    {
        let mut buffer = Buffer([0x11; 1024]);
        let origin = NonNull::from(&mut buffer.0).cast::<u8>();
        let mut heap = unsafe { RawHeap::init(origin) };
        let mut blocks = Vec::new();
        for &size in sizes {
            let block = heap.append(size);
            blocks.push(block);
            let spacer = heap.append(32);
            heap.format(spacer, 32, TagFlags::ALLOCATED);
            let epilogue = heap.next(spacer);
            heap.set_prev_allocated(epilogue, true);
        }
        test_fn(&mut heap, &blocks);
    }

    fn listed(heap: &RawHeap) -> Vec<usize> {
        heap.free_blocks().map(|info| info.size).collect()
    }

    #[test]
    fn test_empty_list() {
        with_free_blocks(&[], |heap, _| {
            assert_eq!(heap.next_link(SENTINEL), SENTINEL);
            assert_eq!(heap.prev_link(SENTINEL), SENTINEL);
            assert_eq!(heap.first_fit(32), None);
            assert_eq!(heap.free_blocks().count(), 0);
        });
    }

    #[test]
    fn test_insert_appends_at_tail() {
        with_free_blocks(&[64, 96, 128], |heap, blocks| {
            heap.insert(blocks[1]);
            heap.insert(blocks[0]);
            heap.insert(blocks[2]);
            assert_eq!(listed(heap), [96, 64, 128]);
            assert_eq!(heap.free_count(), 3);
            assert_eq!(heap.prev_link(SENTINEL), blocks[2]);
            assert_eq!(heap.prev_link(blocks[0]), blocks[1]);
            assert_eq!(heap.next_link(blocks[0]), blocks[2]);
        });
    }

    #[test]
    fn test_remove_head_middle_tail() {
        with_free_blocks(&[64, 96, 128, 160], |heap, blocks| {
            for &block in blocks {
                heap.insert(block);
            }
            heap.remove(blocks[1]);
            assert_eq!(listed(heap), [64, 128, 160]);
            heap.remove(blocks[0]);
            assert_eq!(listed(heap), [128, 160]);
            heap.remove(blocks[3]);
            assert_eq!(listed(heap), [128]);
            heap.remove(blocks[2]);
            assert_eq!(listed(heap), Vec::<usize>::new());
            assert_eq!(heap.next_link(SENTINEL), SENTINEL);
            assert_eq!(heap.prev_link(SENTINEL), SENTINEL);
        });
    }

    #[test]
    fn test_first_fit_uses_list_order() {
        with_free_blocks(&[64, 160, 96, 128], |heap, blocks| {
            heap.insert(blocks[2]);
            heap.insert(blocks[1]);
            heap.insert(blocks[3]);
            heap.insert(blocks[0]);

            // 96 is listed first and is big enough
            assert_eq!(heap.first_fit(80), Some(blocks[2]));
            // the 160 block precedes the 128 one in the list
            assert_eq!(heap.first_fit(100), Some(blocks[1]));
            assert_eq!(heap.first_fit(32), Some(blocks[2]));
            assert_eq!(heap.first_fit(161), None);
        });
    }

    #[test]
    fn test_first_block_offset() {
        with_free_blocks(&[64], |heap, blocks| {
            assert_eq!(blocks[0], FIRST_BLOCK);
            heap.insert(blocks[0]);
            assert_eq!(heap.first_fit(64), Some(FIRST_BLOCK));
        });
    }
}
