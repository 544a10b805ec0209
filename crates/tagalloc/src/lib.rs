//! A boundary-tag heap allocator with an explicit free list.
//!
//! The heap carves variable-sized blocks out of one contiguous arena that
//! only ever grows at its high end. Every block begins with a header holding
//! its size and allocation state; free blocks also carry a footer, so a
//! block being released can find and merge with its free neighbours in
//! constant time.
//!
//! Free blocks are threaded onto a circular doubly linked list rooted at a
//! sentinel. Allocation is first fit in list order, new free blocks go to
//! the tail, and a block is split when what remains after a request could
//! still hold a block of its own.
//!
//! ```text
//!  arena origin                                                    break
//!  │                                                                   │
//!  ▼                                                                   ▼
//!  ┌──────────┬─────────┬──────────────┬─────────┬──────────┬──────────┐
//!  │ sentinel │ alloc'd │     free     │ alloc'd │   free   │ epilogue │
//!  └──────────┴─────────┴──────────────┴─────────┴──────────┴──────────┘
//!       │                 ▲                          ▲
//!       └── free list ────┘──────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Every payload pointer is aligned to [`ALIGNMENT`] (16 bytes).
//! - Every block is at least [`MIN_BLOCK_SIZE`] bytes, and an allocated
//!   block spends [`OVERHEAD`] bytes on its header.
//! - No two free blocks are ever physically adjacent after an operation
//!   completes.
//! - The arena is grown in chunks of at least
//!   [`HeapConfig::growth_chunk`] bytes and never shrinks.
//!
//! # Usage
//!
//! ```rust
//! use tagalloc::{Heap, ReservedArena};
//!
//! let arena = ReservedArena::new(1 << 20).unwrap();
//! let mut heap = Heap::new(arena).unwrap();
//!
//! let ptr = heap.allocate(100).unwrap();
//! assert_eq!(ptr.addr().get() % tagalloc::ALIGNMENT, 0);
//! unsafe { ptr.write_bytes(0xa5, 100) };
//!
//! let ptr = unsafe { heap.reallocate(Some(ptr), 200) }.unwrap();
//! assert_eq!(unsafe { ptr.read() }, 0xa5);
//!
//! unsafe { heap.release(ptr) };
//! heap.check_heap().unwrap();
//! assert_eq!(heap.stats().allocated_blocks, 0);
//! ```
//!
//! A heap can also run on borrowed memory, which needs no `alloc` at all:
//!
//! ```rust
//! use tagalloc::{Heap, HeapConfig, SliceArena};
//!
//! let mut buffer = [0_u8; 1024];
//! let config = HeapConfig {
//!     growth_chunk: 256,
//!     initial_chunk: 0,
//! };
//! let mut heap = Heap::with_config(SliceArena::new(&mut buffer), config).unwrap();
//! assert!(heap.allocate(64).is_some());
//! assert!(heap.allocate(4096).is_none());
//! ```
//!
//! # Thread Safety
//!
//! [`Heap`] is `Send` when its arena is, but not `Sync`. [`LockedHeap`]
//! wraps one in a spin lock and implements
//! [`GlobalAlloc`](core::alloc::GlobalAlloc), so it can serve as a
//! `#[global_allocator]`.
//!
//! # Features
//!
//! - `alloc` (default): [`ReservedArena`], an arena backed by one up-front
//!   reservation from the global allocator.
//! - `debug-check`: run the consistency checker after every mutating
//!   operation and panic on the first violation. Slow; meant for tests.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    arena::{ArenaSource, SliceArena},
    block::{ALIGNMENT, BlockInfo, Blocks, MIN_BLOCK_SIZE, OVERHEAD},
    check::{CheckError, Invariant},
    error::{HeapError, Location},
    free_list::FreeBlocks,
    heap::{Heap, HeapConfig, HeapStats},
    locked::LockedHeap,
};
#[cfg(feature = "alloc")]
pub use self::arena::{ArenaError, ReservedArena};

pub mod arena;
mod block;
pub mod check;
mod coalesce;
pub mod error;
mod free_list;
mod heap;
mod locked;
mod place;
