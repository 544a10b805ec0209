//! First-fit placement and block splitting.

use crate::block::{Block, MIN_BLOCK_SIZE, RawHeap, TagFlags};

impl RawHeap {
    /// Finds a listed block of at least `asize` bytes.
    ///
    /// This is first fit in free-list order, not best fit: the answer depends
    /// on the order in which blocks were freed.
    pub(crate) fn find_fit(&self, asize: usize) -> Option<Block> {
        self.first_fit(asize)
    }

    /// Allocates the first `asize` bytes of the listed free `block`.
    ///
    /// If what is left over could hold a block of its own, it is split off
    /// and listed as a new free block. Otherwise the whole block is handed
    /// out, and the slack becomes internal fragmentation.
    pub(crate) fn place(&mut self, block: Block, asize: usize) {
        let block_size = self.size(block);
        assert!(block_size >= asize, "placed block is too small");

        self.remove(block);
        let remainder = block_size - asize;
        if remainder >= MIN_BLOCK_SIZE {
            self.write_block(block, asize, true);
            let rest = self.next(block);
            self.format(rest, remainder, TagFlags::PREV_ALLOCATED);
            self.insert(rest);
        } else {
            self.write_block(block, block_size, true);
            let next = self.next(block);
            self.set_prev_allocated(next, true);
        }
    }
}
