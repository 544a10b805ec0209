//! Heap consistency checker.
//!
//! [`Heap::check_heap`](crate::Heap::check_heap) walks every physical block
//! and then the free list in both directions, and reports the first broken
//! invariant. It is a diagnostic: allocation never depends on it, and it
//! never repairs anything.

use snafu::{Snafu, ensure};

use self::check_error::{
    AdjacentFreeSnafu, BrokenLinkSnafu, CountMismatchSnafu, FooterMismatchSnafu,
    ListedAllocatedSnafu, MarkerSnafu, MisalignedSnafu, OutOfBoundsSnafu, OverrunSnafu,
    PrevBitSnafu, TooSmallSnafu,
};
use crate::{
    block::{ALIGNMENT, Block, FIRST_BLOCK, MIN_BLOCK_SIZE, OVERHEAD, RawHeap, SENTINEL},
    error::Location,
};

/// The structural property a [`CheckError`] found broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Invariant {
    /// Blocks tile the arena exactly, from the first block to the epilogue.
    #[display("partition")]
    Partition,
    /// Every block can hold a header, two links and a footer.
    #[display("minimum block size")]
    MinimumSize,
    /// Block sizes and payload addresses are multiples of the alignment.
    #[display("alignment")]
    Alignment,
    /// A free block's footer matches its header.
    #[display("boundary tag")]
    BoundaryTag,
    /// No two free blocks are physically adjacent.
    #[display("coalescing")]
    Coalescing,
    /// The free list holds exactly the free blocks.
    #[display("free-list membership")]
    FreeListMembership,
    /// Each header knows whether its physical predecessor is allocated.
    #[display("predecessor bit")]
    PredecessorBit,
}

/// A heap invariant violation.
///
/// `block` is always the address of the offending block header, and
/// `location` is the call site that requested the check.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum CheckError {
    #[snafu(display("block {block:#x} of {size} bytes overruns the epilogue at {epilogue:#x} (checked at {location})"))]
    Overrun {
        block: usize,
        size: usize,
        epilogue: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("boundary marker {block:#x} is corrupted: {bits:#x} (checked at {location})"))]
    Marker {
        block: usize,
        bits: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {block:#x} is {size} bytes, below the minimum (checked at {location})"))]
    TooSmall {
        block: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {block:#x} has a misaligned header {bits:#x} (checked at {location})"))]
    Misaligned {
        block: usize,
        bits: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free block {block:#x}: header {header:#x} != footer {footer:#x} (checked at {location})"))]
    FooterMismatch {
        block: usize,
        header: usize,
        footer: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free blocks {block:#x} and {next:#x} are adjacent (checked at {location})"))]
    AdjacentFree {
        block: usize,
        next: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block {block:#x} says its predecessor is {}allocated (checked at {location})", if *claimed { "" } else { "not " }))]
    PrevBit {
        block: usize,
        claimed: bool,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free-list link {block:#x} does not name a block in the heap (checked at {location})"))]
    OutOfBounds {
        block: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocated block {block:#x} is on the free list (checked at {location})"))]
    ListedAllocated {
        block: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free-list links around {block:#x} are not symmetric (checked at {location})"))]
    BrokenLink {
        block: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free list holds {listed} blocks but the heap has {physical} free blocks (checked at {location})"))]
    CountMismatch {
        block: usize,
        listed: usize,
        physical: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl CheckError {
    #[must_use]
    pub fn invariant(&self) -> Invariant {
        match self {
            Self::Overrun { .. } | Self::Marker { .. } => Invariant::Partition,
            Self::TooSmall { .. } => Invariant::MinimumSize,
            Self::Misaligned { .. } => Invariant::Alignment,
            Self::FooterMismatch { .. } => Invariant::BoundaryTag,
            Self::AdjacentFree { .. } => Invariant::Coalescing,
            Self::PrevBit { .. } => Invariant::PredecessorBit,
            Self::OutOfBounds { .. }
            | Self::ListedAllocated { .. }
            | Self::BrokenLink { .. }
            | Self::CountMismatch { .. } => Invariant::FreeListMembership,
        }
    }

    /// Address of the offending block header.
    #[must_use]
    pub fn block(&self) -> usize {
        match self {
            Self::Overrun { block, .. }
            | Self::Marker { block, .. }
            | Self::TooSmall { block, .. }
            | Self::Misaligned { block, .. }
            | Self::FooterMismatch { block, .. }
            | Self::AdjacentFree { block, .. }
            | Self::PrevBit { block, .. }
            | Self::OutOfBounds { block, .. }
            | Self::ListedAllocated { block, .. }
            | Self::BrokenLink { block, .. }
            | Self::CountMismatch { block, .. } => *block,
        }
    }

    /// The call site that requested the check.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::Overrun { location, .. }
            | Self::Marker { location, .. }
            | Self::TooSmall { location, .. }
            | Self::Misaligned { location, .. }
            | Self::FooterMismatch { location, .. }
            | Self::AdjacentFree { location, .. }
            | Self::PrevBit { location, .. }
            | Self::OutOfBounds { location, .. }
            | Self::ListedAllocated { location, .. }
            | Self::BrokenLink { location, .. }
            | Self::CountMismatch { location, .. } => *location,
        }
    }
}

/// Whether a free-list link can name a block: inside the block sequence and
/// placed so the block's payload is aligned. Links failing this are never
/// dereferenced.
fn is_block_start(node: Block, epilogue: Block) -> bool {
    node >= FIRST_BLOCK
        && node < epilogue
        && (node.offset() + OVERHEAD).is_multiple_of(ALIGNMENT)
}

impl RawHeap {
    #[track_caller]
    pub(crate) fn check(&self) -> Result<(), CheckError> {
        self.check_markers()?;
        let physical_free = self.check_blocks()?;
        self.check_free_list(physical_free)
    }

    #[track_caller]
    fn check_markers(&self) -> Result<(), CheckError> {
        for marker in [SENTINEL, self.epilogue()] {
            let header = self.header(marker);
            ensure!(
                header.size() == 0 && header.is_allocated(),
                MarkerSnafu {
                    block: self.address(marker),
                    bits: header.bits(),
                }
            );
        }
        Ok(())
    }

    /// Walks the physical blocks and returns how many are free.
    #[track_caller]
    fn check_blocks(&self) -> Result<usize, CheckError> {
        let epilogue = self.epilogue();
        let mut block = FIRST_BLOCK;
        let mut prev: Option<Block> = None;
        let mut prev_allocated = true;
        let mut free = 0;

        while block < epilogue {
            let addr = self.address(block);
            let header = self.header(block);
            let size = header.size();

            ensure!(size >= MIN_BLOCK_SIZE, TooSmallSnafu { block: addr, size });
            ensure!(
                !header.has_stray_bits()
                    && self.payload(block).addr().get().is_multiple_of(ALIGNMENT),
                MisalignedSnafu {
                    block: addr,
                    bits: header.bits(),
                }
            );
            let fits = block
                .offset()
                .checked_add(size)
                .is_some_and(|end| end <= epilogue.offset());
            ensure!(
                fits,
                OverrunSnafu {
                    block: addr,
                    size,
                    epilogue: self.address(epilogue),
                }
            );
            ensure!(
                header.is_prev_allocated() == prev_allocated,
                PrevBitSnafu {
                    block: addr,
                    claimed: header.is_prev_allocated(),
                }
            );

            if !header.is_allocated() {
                let footer = self.footer(block);
                ensure!(
                    footer == header.footer(),
                    FooterMismatchSnafu {
                        block: addr,
                        header: header.bits(),
                        footer: footer.bits(),
                    }
                );
                if let Some(prev) = prev {
                    ensure!(
                        prev_allocated,
                        AdjacentFreeSnafu {
                            block: self.address(prev),
                            next: addr,
                        }
                    );
                }
                free += 1;
            }

            prev = Some(block);
            prev_allocated = header.is_allocated();
            block = self.next(block);
        }

        let header = self.header(epilogue);
        ensure!(
            header.is_prev_allocated() == prev_allocated,
            PrevBitSnafu {
                block: self.address(epilogue),
                claimed: header.is_prev_allocated(),
            }
        );
        Ok(free)
    }

    #[track_caller]
    fn check_free_list(&self, physical_free: usize) -> Result<(), CheckError> {
        let epilogue = self.epilogue();
        let sentinel = self.address(SENTINEL);

        let mut listed = 0;
        let mut prev = SENTINEL;
        let mut node = self.next_link(SENTINEL);
        while node != SENTINEL {
            let addr = self.address(node);
            ensure!(
                is_block_start(node, epilogue),
                OutOfBoundsSnafu { block: addr }
            );
            ensure!(!self.is_allocated(node), ListedAllocatedSnafu { block: addr });
            ensure!(self.prev_link(node) == prev, BrokenLinkSnafu { block: addr });
            listed += 1;
            // a cycle that skips the sentinel would otherwise never end
            ensure!(
                listed <= physical_free,
                CountMismatchSnafu {
                    block: addr,
                    listed,
                    physical: physical_free,
                }
            );
            prev = node;
            node = self.next_link(node);
        }
        ensure!(
            self.prev_link(SENTINEL) == prev,
            BrokenLinkSnafu { block: sentinel }
        );
        ensure!(
            listed == physical_free && listed == self.free_count(),
            CountMismatchSnafu {
                block: sentinel,
                listed,
                physical: physical_free,
            }
        );

        let mut backward = 0;
        let mut node = self.prev_link(SENTINEL);
        while node != SENTINEL {
            let addr = self.address(node);
            ensure!(
                is_block_start(node, epilogue),
                OutOfBoundsSnafu { block: addr }
            );
            backward += 1;
            ensure!(
                backward <= physical_free,
                CountMismatchSnafu {
                    block: addr,
                    listed: backward,
                    physical: physical_free,
                }
            );
            node = self.prev_link(node);
        }
        ensure!(
            backward == physical_free,
            CountMismatchSnafu {
                block: sentinel,
                listed: backward,
                physical: physical_free,
            }
        );
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::format;
    use core::ptr::NonNull;

    use super::*;
    use crate::block::{TagFlags, WORD_SIZE};

    #[repr(C, align(16))]
    struct Buffer([u8; 1024]);

    /// Lays out three allocated 64-byte blocks followed by one listed free
    /// block, the way a heap would after three small allocations.
    fn with_checked_heap<F>(test_fn: F)
    where
        F: FnOnce(&mut RawHeap, [Block; 4]),
    {
        let mut buffer = Buffer([0; 1024]);
        let origin = NonNull::from(&mut buffer.0).cast::<u8>();
        let mut heap = unsafe { RawHeap::init(origin) };
        let first = heap.append(512);
        heap.insert(first);
        heap.place(first, 64);
        let second = heap.next(first);
        heap.place(second, 64);
        let third = heap.next(second);
        heap.place(third, 64);
        let rest = heap.next(third);
        heap.check().unwrap();
        test_fn(&mut heap, [first, second, third, rest]);
    }

    fn release_unlisted(heap: &mut RawHeap, block: Block) {
        let size = heap.size(block);
        heap.write_block(block, size, false);
        let next = heap.next(block);
        heap.set_prev_allocated(next, false);
    }

    #[test]
    fn test_consistent_heap_passes() {
        with_checked_heap(|heap, [_, second, _, _]| {
            release_unlisted(heap, second);
            heap.insert(second);
            heap.check().unwrap();
        });
    }

    #[test]
    fn test_corrupted_epilogue() {
        with_checked_heap(|heap, _| {
            let epilogue = heap.epilogue();
            heap.write_word(epilogue.offset(), 32 | TagFlags::ALLOCATED.bits());
            let err = heap.check().unwrap_err();
            assert!(matches!(err, CheckError::Marker { bits: 0x21, .. }));
            assert_eq!(err.invariant(), Invariant::Partition);
            assert_eq!(err.block(), heap.address(epilogue));
        });
    }

    #[test]
    fn test_block_overrunning_epilogue() {
        with_checked_heap(|heap, [_, _, third, _]| {
            let bits = 1024 | (TagFlags::ALLOCATED | TagFlags::PREV_ALLOCATED).bits();
            heap.write_word(third.offset(), bits);
            let err = heap.check().unwrap_err();
            assert!(matches!(err, CheckError::Overrun { size: 1024, .. }));
            assert_eq!(err.invariant(), Invariant::Partition);
            assert_eq!(err.block(), heap.address(third));
        });
    }

    #[test]
    fn test_undersized_block() {
        with_checked_heap(|heap, [_, second, _, _]| {
            let bits = 16 | (TagFlags::ALLOCATED | TagFlags::PREV_ALLOCATED).bits();
            heap.write_word(second.offset(), bits);
            let err = heap.check().unwrap_err();
            assert_eq!(err.invariant(), Invariant::MinimumSize);
            assert_eq!(err.block(), heap.address(second));
        });
    }

    #[test]
    fn test_stray_size_bits() {
        with_checked_heap(|heap, [_, second, _, _]| {
            let bits = 72 | (TagFlags::ALLOCATED | TagFlags::PREV_ALLOCATED).bits();
            heap.write_word(second.offset(), bits);
            let err = heap.check().unwrap_err();
            assert_eq!(err.invariant(), Invariant::Alignment);
            assert!(matches!(err, CheckError::Misaligned { bits: 0x4b, .. }));
        });
    }

    #[test]
    fn test_wrong_predecessor_bit() {
        with_checked_heap(|heap, [_, second, _, _]| {
            heap.set_prev_allocated(second, false);
            let err = heap.check().unwrap_err();
            assert!(matches!(err, CheckError::PrevBit { claimed: false, .. }));
            assert_eq!(err.invariant(), Invariant::PredecessorBit);
            assert_eq!(err.block(), heap.address(second));
        });
    }

    #[test]
    fn test_footer_mismatch() {
        with_checked_heap(|heap, [_, _, _, rest]| {
            let size = heap.size(rest);
            heap.write_word(rest.offset() + size - WORD_SIZE, size + 16);
            let err = heap.check().unwrap_err();
            assert_eq!(err.invariant(), Invariant::BoundaryTag);
            assert_eq!(err.block(), heap.address(rest));
        });
    }

    #[test]
    fn test_uncoalesced_neighbours() {
        with_checked_heap(|heap, [_, _, third, rest]| {
            release_unlisted(heap, third);
            heap.insert(third);
            let err = heap.check().unwrap_err();
            assert_eq!(err.invariant(), Invariant::Coalescing);
            assert!(matches!(
                err,
                CheckError::AdjacentFree { block, next, .. }
                    if block == heap.address(third) && next == heap.address(rest)
            ));
        });
    }

    #[test]
    fn test_free_block_missing_from_list() {
        with_checked_heap(|heap, [_, second, _, _]| {
            release_unlisted(heap, second);
            let err = heap.check().unwrap_err();
            assert_eq!(err.invariant(), Invariant::FreeListMembership);
            assert!(matches!(
                err,
                CheckError::CountMismatch {
                    listed: 1,
                    physical: 2,
                    ..
                }
            ));
        });
    }

    #[test]
    fn test_allocated_block_on_list() {
        with_checked_heap(|heap, [_, _, _, rest]| {
            let size = heap.size(rest);
            heap.write_block(rest, size, true);
            let epilogue = heap.epilogue();
            heap.set_prev_allocated(epilogue, true);
            let err = heap.check().unwrap_err();
            assert!(matches!(err, CheckError::ListedAllocated { .. }));
            assert_eq!(err.block(), heap.address(rest));
        });
    }

    #[test]
    fn test_asymmetric_links() {
        with_checked_heap(|heap, [first, second, _, _]| {
            release_unlisted(heap, second);
            heap.insert(second);
            // second follows rest in the list, but now claims first instead
            heap.write_word(second.offset() + WORD_SIZE, first.offset());
            let err = heap.check().unwrap_err();
            assert!(matches!(err, CheckError::BrokenLink { .. }));
            assert_eq!(err.block(), heap.address(second));
        });
    }

    #[test]
    fn test_link_outside_heap() {
        with_checked_heap(|heap, _| {
            heap.write_word(SENTINEL.offset() + 2 * WORD_SIZE, 0x1_0000);
            let err = heap.check().unwrap_err();
            assert!(matches!(err, CheckError::OutOfBounds { .. }));
            assert_eq!(err.block(), heap.address(SENTINEL) + 0x1_0000);
        });
    }

    #[test]
    fn test_misaligned_link() {
        for bad in [FIRST_BLOCK.offset() + 1, FIRST_BLOCK.offset() + WORD_SIZE] {
            with_checked_heap(|heap, _| {
                heap.write_word(SENTINEL.offset() + 2 * WORD_SIZE, bad);
                let err = heap.check().unwrap_err();
                assert!(matches!(err, CheckError::OutOfBounds { .. }));
                assert_eq!(err.invariant(), Invariant::FreeListMembership);
                assert_eq!(err.block(), heap.address(SENTINEL) + bad);
            });
        }
    }

    #[test]
    fn test_misaligned_link_in_list_tail() {
        with_checked_heap(|heap, [.., rest]| {
            // the only listed block points onward into the middle of a block
            heap.write_word(rest.offset() + 2 * WORD_SIZE, rest.offset() + 3);
            let err = heap.check().unwrap_err();
            assert!(matches!(err, CheckError::OutOfBounds { .. }));
            assert_eq!(err.block(), heap.address(rest) + 3);
        });
    }

    #[test]
    fn test_error_message_names_location() {
        with_checked_heap(|heap, [_, second, _, _]| {
            heap.set_prev_allocated(second, false);
            let err = heap.check().unwrap_err();
            let location = err.location();
            assert_eq!(location.file(), file!());

            let message = format!("{err}");
            assert!(message.contains("not allocated"));
            assert!(message.ends_with(&format!("(checked at {location})")));
            assert_eq!(format!("{}", err.invariant()), "predecessor bit");
        });
    }
}
