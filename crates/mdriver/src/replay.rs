//! Replays a [`Trace`] against a fresh heap.
//!
//! Every payload handed out is checked for alignment and for overlap with
//! the other live payloads, then filled with a byte pattern derived from its
//! id. The pattern is verified again before the payload is released or
//! reallocated, so any write the allocator makes into a live payload shows
//! up as [`ReplayError::Corrupted`].

use std::{
    collections::BTreeMap,
    ptr::NonNull,
    slice,
    time::{Duration, Instant},
};

use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};
use tagalloc::{
    ALIGNMENT, ArenaError, CheckError, Heap, HeapConfig, HeapError, Location, ReservedArena,
};

use self::replay_error::{
    CheckSnafu, CorruptedSnafu, CreateArenaSnafu, CreateHeapSnafu, DeadIdSnafu, LiveIdSnafu,
    MisalignedSnafu, NotZeroedSnafu, OutOfMemorySnafu, OverflowServedSnafu, OverlapSnafu,
};
use crate::trace::{Op, Step, Trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayConfig {
    /// Bytes reserved for the arena.
    pub capacity: usize,
    /// Initial size and minimum growth of the heap.
    pub chunk: usize,
    /// Run the heap checker after every request.
    pub check: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: ReservedArena::DEFAULT_CAPACITY,
            chunk: HeapConfig::DEFAULT_CHUNK,
            check: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub ops: usize,
    /// Largest total of requested bytes live at the same time.
    pub peak_payload: usize,
    /// Arena size after the last request.
    pub arena_size: usize,
    pub elapsed: Duration,
}

impl ReplayStats {
    /// Peak payload as a fraction of the arena size.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        if self.arena_size == 0 {
            return 0.0;
        }
        self.peak_payload as f64 / self.arena_size as f64
    }

    /// Requests per second.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn throughput(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        self.ops as f64 / self.elapsed.as_secs_f64()
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ReplayError {
    #[snafu(display("failed to reserve an arena of {capacity} bytes"))]
    CreateArena {
        capacity: usize,
        #[snafu(source)]
        source: ArenaError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to create the heap"))]
    CreateHeap {
        #[snafu(source)]
        source: HeapError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: `{op}` failed"))]
    OutOfMemory {
        line: usize,
        op: Op,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: `{op}` overflows but was served"))]
    OverflowServed {
        line: usize,
        op: Op,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: block {id} at {addr:#x} is not aligned to {ALIGNMENT} bytes"))]
    Misaligned {
        line: usize,
        id: usize,
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: block {id} at {addr:#x} overlaps live block {other}"))]
    Overlap {
        line: usize,
        id: usize,
        addr: usize,
        other: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "line {line}: byte {offset} of block {id} is {found:#04x}, expected {expected:#04x}"
    ))]
    Corrupted {
        line: usize,
        id: usize,
        offset: usize,
        expected: u8,
        found: u8,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: byte {offset} of zeroed block {id} is {found:#04x}"))]
    NotZeroed {
        line: usize,
        id: usize,
        offset: usize,
        found: u8,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: block {id} is not live"))]
    DeadId {
        line: usize,
        id: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: block {id} is already live"))]
    LiveId {
        line: usize,
        id: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: heap check failed"))]
    Check {
        line: usize,
        #[snafu(source)]
        source: CheckError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ReplayError {
    /// Trace line of the failing request, if the failure came from one.
    #[must_use]
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::CreateArena { .. } | Self::CreateHeap { .. } => None,
            Self::OutOfMemory { line, .. }
            | Self::OverflowServed { line, .. }
            | Self::Misaligned { line, .. }
            | Self::Overlap { line, .. }
            | Self::Corrupted { line, .. }
            | Self::NotZeroed { line, .. }
            | Self::DeadId { line, .. }
            | Self::LiveId { line, .. }
            | Self::Check { line, .. } => Some(*line),
        }
    }

    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::CreateArena { location, .. }
            | Self::CreateHeap { location, .. }
            | Self::OutOfMemory { location, .. }
            | Self::OverflowServed { location, .. }
            | Self::Misaligned { location, .. }
            | Self::Overlap { location, .. }
            | Self::Corrupted { location, .. }
            | Self::NotZeroed { location, .. }
            | Self::DeadId { location, .. }
            | Self::LiveId { location, .. }
            | Self::Check { location, .. } => *location,
        }
    }
}

/// Byte stored at `offset` of block `id`.
#[expect(clippy::cast_possible_truncation)]
fn pattern(id: usize, offset: usize) -> u8 {
    (id.wrapping_mul(0x9e37_79b9) ^ offset.wrapping_mul(7)) as u8
}

#[derive(Debug, Clone, Copy)]
struct Block {
    ptr: NonNull<u8>,
    /// Requested size; the bytes the trace may use.
    size: usize,
}

impl Block {
    fn bytes(&self, len: usize) -> &[u8] {
        debug_assert!(len <= self.size);
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }

    fn fill(&self, id: usize) {
        let bytes = unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) };
        for (offset, byte) in bytes.iter_mut().enumerate() {
            *byte = pattern(id, offset);
        }
    }
}

/// Replays traces against one heap.
pub struct Replayer {
    heap: Heap<ReservedArena>,
    check: bool,
    live: Vec<Option<Block>>,
    /// Payload start to `(payload end, id)` for every live block.
    spans: BTreeMap<usize, (usize, usize)>,
    live_payload: usize,
    stats: ReplayStats,
}

impl Replayer {
    #[track_caller]
    pub fn new(config: &ReplayConfig) -> Result<Self, ReplayError> {
        let arena = ReservedArena::new(config.capacity).context(CreateArenaSnafu {
            capacity: config.capacity,
        })?;
        let heap_config = HeapConfig {
            growth_chunk: config.chunk,
            initial_chunk: config.chunk,
        };
        let heap = Heap::with_config(arena, heap_config).context(CreateHeapSnafu)?;
        Ok(Self {
            heap,
            check: config.check,
            live: Vec::new(),
            spans: BTreeMap::new(),
            live_payload: 0,
            stats: ReplayStats::default(),
        })
    }

    #[must_use]
    pub fn heap(&self) -> &Heap<ReservedArena> {
        &self.heap
    }

    /// Ids currently holding a block.
    pub fn live_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.live
            .iter()
            .enumerate()
            .filter_map(|(id, block)| block.map(|_| id))
    }

    /// Replays every request of `trace`, stopping at the first failure.
    pub fn run(&mut self, trace: &Trace) -> Result<ReplayStats, ReplayError> {
        if self.live.len() < trace.id_count() {
            self.live.resize(trace.id_count(), None);
        }
        let start = Instant::now();
        for step in trace.steps() {
            self.step(step)?;
        }
        self.stats.elapsed += start.elapsed();
        self.stats.arena_size = self.heap.stats().arena_size;
        Ok(self.stats)
    }

    pub fn step(&mut self, step: &Step) -> Result<(), ReplayError> {
        let Step { line, op } = *step;
        if self.live.len() <= op.id() {
            self.live.resize(op.id() + 1, None);
        }

        match op {
            Op::Allocate { id, size } => {
                ensure!(self.live[id].is_none(), LiveIdSnafu { line, id });
                match self.heap.allocate(size) {
                    Some(ptr) => self.adopt(line, id, ptr, size)?,
                    None => {
                        ensure!(size == 0, OutOfMemorySnafu { line, op });
                    }
                }
            }
            Op::Release { id } => {
                let block = self.disown(line, id)?;
                unsafe { self.heap.release(block.ptr) };
            }
            Op::Reallocate { id, size } => {
                let old = if self.live[id].is_some() {
                    Some(self.disown(line, id)?)
                } else {
                    None
                };
                match unsafe { self.heap.reallocate(old.map(|block| block.ptr), size) } {
                    Some(ptr) => {
                        let kept = old.map_or(0, |block| block.size.min(size));
                        let moved = Block { ptr, size };
                        self.verify(line, id, &moved, kept)?;
                        self.adopt(line, id, ptr, size)?;
                    }
                    None => {
                        ensure!(size == 0, OutOfMemorySnafu { line, op });
                    }
                }
            }
            Op::Callocate { id, count, size } => {
                ensure!(self.live[id].is_none(), LiveIdSnafu { line, id });
                let ptr = self.heap.callocate(count, size);
                match count.checked_mul(size) {
                    // refused without a block; the id stays dead
                    None => {
                        ensure!(ptr.is_none(), OverflowServedSnafu { line, op });
                    }
                    Some(len) => {
                        let ptr = ptr.context(OutOfMemorySnafu { line, op })?;
                        let zeroed = Block { ptr, size: len };
                        if let Some((offset, &found)) =
                            zeroed.bytes(len).iter().enumerate().find(|&(_, &b)| b != 0)
                        {
                            return NotZeroedSnafu {
                                line,
                                id,
                                offset,
                                found,
                            }
                            .fail();
                        }
                        self.adopt(line, id, ptr, len)?;
                    }
                }
            }
        }
        trace!("line {line}: {op}, {} bytes live", self.live_payload);

        if self.check {
            self.heap.check_heap().context(CheckSnafu { line })?;
        }
        self.stats.ops += 1;
        Ok(())
    }

    /// Records a fresh payload for `id` after checking where it landed, then
    /// writes the id's pattern into it.
    fn adopt(
        &mut self,
        line: usize,
        id: usize,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<(), ReplayError> {
        let addr = ptr.addr().get();
        ensure!(
            addr.is_multiple_of(ALIGNMENT),
            MisalignedSnafu { line, id, addr }
        );
        let end = addr + unsafe { self.heap.usable_size(ptr) };
        if let Some((_, &(prev_end, other))) = self.spans.range(..end).next_back() {
            ensure!(
                prev_end <= addr,
                OverlapSnafu {
                    line,
                    id,
                    addr,
                    other,
                }
            );
        }

        let block = Block { ptr, size };
        block.fill(id);
        self.spans.insert(addr, (end, id));
        self.live[id] = Some(block);
        self.live_payload += size;
        self.stats.peak_payload = self.stats.peak_payload.max(self.live_payload);
        Ok(())
    }

    /// Verifies and forgets the block held by `id`, handing it back so the
    /// caller can release or move it.
    fn disown(&mut self, line: usize, id: usize) -> Result<Block, ReplayError> {
        let block = self.live[id].context(DeadIdSnafu { line, id })?;
        self.verify(line, id, &block, block.size)?;
        self.live[id] = None;
        self.spans.remove(&block.ptr.addr().get());
        self.live_payload -= block.size;
        Ok(block)
    }

    fn verify(&self, line: usize, id: usize, block: &Block, len: usize) -> Result<(), ReplayError> {
        let mismatch = block
            .bytes(len)
            .iter()
            .enumerate()
            .find(|&(offset, &byte)| byte != pattern(id, offset));
        match mismatch {
            Some((offset, &found)) => CorruptedSnafu {
                line,
                id,
                offset,
                expected: pattern(id, offset),
                found,
            }
            .fail(),
            None => Ok(()),
        }
    }
}

/// Replays `trace` on a fresh heap built from `config`.
pub fn replay(trace: &Trace, config: &ReplayConfig) -> Result<ReplayStats, ReplayError> {
    Replayer::new(config)?.run(trace)
}
