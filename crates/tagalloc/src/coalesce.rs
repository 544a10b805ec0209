//! Immediate coalescing of physically adjacent free blocks.

use crate::block::{Block, RawHeap};

impl RawHeap {
    /// Merges the free, unlisted `block` with its free physical neighbours
    /// and lists the result.
    ///
    /// Returns the merged block, which starts at the predecessor when the
    /// predecessor was free. The epilogue and the sentinel count as allocated,
    /// so nothing outside the arena is ever merged.
    pub(crate) fn coalesce(&mut self, block: Block) -> Block {
        debug_assert!(!self.is_allocated(block));

        let next = self.next(block);
        let next_free = !self.is_allocated(next);
        let prev = self.prev_free(block);
        let mut size = self.size(block);

        let merged = match (prev, next_free) {
            (None, false) => block,
            (None, true) => {
                self.remove(next);
                size += self.size(next);
                block
            }
            (Some(prev), false) => {
                self.remove(prev);
                size += self.size(prev);
                prev
            }
            (Some(prev), true) => {
                self.remove(prev);
                self.remove(next);
                size += self.size(prev) + self.size(next);
                prev
            }
        };

        self.write_block(merged, size, false);
        self.insert(merged);
        merged
    }
}
