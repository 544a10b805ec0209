//! Error types shared by the heap and its arena sources.

use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

/// Source location captured implicitly when an error is built.
///
/// Every public entry point that can fail is `#[track_caller]`, so the
/// location recorded here is the caller's call site rather than a line inside
/// this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    file: &'static str,
    line: u32,
}

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.file
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        let caller = core::panic::Location::caller();
        Self {
            file: caller.file(),
            line: caller.line(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Errors raised while setting up a [`Heap`](crate::Heap).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HeapError {
    #[snafu(display("arena source could not provide {requested} bytes"))]
    ArenaExhausted {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena origin {addr:#x} is not aligned to 16 bytes"))]
    MisalignedArena {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap is already initialized"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: Location,
    },
}

impl HeapError {
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::ArenaExhausted { location, .. }
            | Self::MisalignedArena { location, .. }
            | Self::AlreadyInitialized { location } => *location,
        }
    }
}
