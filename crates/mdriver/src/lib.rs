//! Trace-driven correctness and utilization checks for `tagalloc`.
//!
//! A trace is a plain-text list of allocator requests. [`trace`] parses it,
//! and [`replay`] runs it against a fresh heap while checking that every
//! payload is aligned, disjoint from every other live payload, and keeps the
//! bytes written into it.
//!
//! ```text
//! # comment
//! a 0 512        allocate 512 bytes as block 0
//! r 0 1024       reallocate block 0 to 1024 bytes
//! c 1 16 8       allocate a zeroed array of 16 elements of 8 bytes
//! f 0            release block 0
//! ```

#[macro_use]
pub mod log;

pub mod color;
pub mod replay;
pub mod report;
pub mod trace;
