#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::ptr::NonNull;

use tagalloc::{ArenaSource as _, BlockInfo, Heap, HeapConfig, ReservedArena};

fn new_heap(config: HeapConfig) -> Heap<ReservedArena> {
    let arena = ReservedArena::new(1 << 20).unwrap();
    Heap::with_config(arena, config).unwrap()
}

fn offset(heap: &Heap<ReservedArena>, ptr: NonNull<u8>) -> usize {
    ptr.addr().get() - heap.arena().low_address()
}

/// Physical blocks as `(offset from the arena start, size, allocated)`.
fn layout(heap: &Heap<ReservedArena>) -> Vec<(usize, usize, bool)> {
    let low = heap.arena().low_address();
    heap.blocks()
        .map(|BlockInfo { addr, size, allocated }| (addr - low, size, allocated))
        .collect()
}

#[test]
fn released_block_between_allocated_neighbours_stays_isolated() {
    let mut heap = new_heap(HeapConfig::default());
    let first = heap.allocate(24).unwrap();
    let second = heap.allocate(40).unwrap();
    unsafe { heap.release(first) };
    heap.check_heap().unwrap();

    let blocks = heap.blocks().collect::<Vec<_>>();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].payload_addr(), first.addr().get());
    assert_eq!(blocks[0].size, 32);
    assert!(!blocks[0].allocated);
    assert_eq!(blocks[1].payload_addr(), second.addr().get());
    assert!(blocks[1].allocated);
    assert!(!blocks[2].allocated);

    // the released block was listed after the initial chunk's remainder
    let listed = heap.free_blocks().map(|info| info.addr).collect::<Vec<_>>();
    assert_eq!(listed, [blocks[2].addr, blocks[0].addr]);
}

#[test]
fn exact_fit_reuse_does_not_grow_the_arena() {
    let mut heap = new_heap(HeapConfig::default());
    let first = heap.allocate(4096).unwrap();
    let arena_size = heap.stats().arena_size;
    unsafe { heap.release(first) };

    let second = heap.allocate(4096).unwrap();
    assert_eq!(second, first);
    assert_eq!(heap.stats().arena_size, arena_size);
    heap.check_heap().unwrap();
}

#[test]
fn callocate_boundaries() {
    let mut heap = new_heap(HeapConfig::default());
    let empty = heap.callocate(0, 100).unwrap();
    assert!(unsafe { heap.usable_size(empty) } > 0);
    assert_eq!(unsafe { empty.read() }, 0);

    let before = heap.stats();
    assert!(heap.callocate(usize::MAX, 2).is_none());
    assert_eq!(heap.stats(), before);
    heap.check_heap().unwrap();
}

#[test]
fn reallocate_degenerates_to_allocate_and_release() {
    let mut reallocated = new_heap(HeapConfig::default());
    let mut allocated = new_heap(HeapConfig::default());

    let p = unsafe { reallocated.reallocate(None, 50) }.unwrap();
    let q = allocated.allocate(50).unwrap();
    assert_eq!(offset(&reallocated, p), offset(&allocated, q));
    assert_eq!(layout(&reallocated), layout(&allocated));

    assert!(unsafe { reallocated.reallocate(Some(p), 0) }.is_none());
    unsafe { allocated.release(q) };
    assert_eq!(layout(&reallocated), layout(&allocated));
    assert_eq!(reallocated.stats().allocated_blocks, 0);
}

#[test]
fn releasing_three_neighbours_leaves_one_block() {
    // exact-size growth, so no free remainder follows the third block
    let config = HeapConfig {
        growth_chunk: 16,
        initial_chunk: 0,
    };
    let mut heap = new_heap(config);
    let a = heap.allocate(40).unwrap();
    let b = heap.allocate(40).unwrap();
    let c = heap.allocate(40).unwrap();
    assert_eq!(heap.free_blocks().count(), 0);
    assert_eq!(b.addr().get() - a.addr().get(), 48);
    assert_eq!(c.addr().get() - b.addr().get(), 48);

    unsafe {
        heap.release(b);
        heap.release(a);
        heap.release(c);
    }
    heap.check_heap().unwrap();

    let free = heap.free_blocks().collect::<Vec<_>>();
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].payload_addr(), a.addr().get());
    assert_eq!(free[0].size, 3 * 48);
    assert_eq!(heap.blocks().count(), 1);
}
