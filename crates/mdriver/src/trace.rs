//! Trace file format.
//!
//! One request per line. Blank lines are skipped and `#` starts a comment
//! that runs to the end of the line. Ids name blocks across lines; an id is
//! live from the request that allocates it until the one that releases it.
//!
//! | Line                     | Request                                   |
//! |--------------------------|-------------------------------------------|
//! | `a <id> <size>`          | `allocate(size)`                          |
//! | `f <id>`                 | `release`                                 |
//! | `r <id> <size>`          | `reallocate`, or `allocate` if `id` is dead |
//! | `c <id> <count> <size>`  | `callocate(count, size)`                  |

use std::{
    fs, io,
    num::ParseIntError,
    path::{Path, PathBuf},
    str::{FromStr, SplitWhitespace},
};

use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};
use tagalloc::Location;

use self::{
    load_trace_error::{ParseSnafu, ReadSnafu},
    parse_trace_error::{
        ExtraFieldSnafu, IdTooLargeSnafu, InvalidNumberSnafu, MissingFieldSnafu, UnknownOpSnafu,
    },
};

/// Ids at or above this are rejected, so a typo cannot make the replayer
/// reserve an absurd id table.
pub const MAX_ID: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Op {
    #[display("a {id} {size}")]
    Allocate { id: usize, size: usize },
    #[display("f {id}")]
    Release { id: usize },
    #[display("r {id} {size}")]
    Reallocate { id: usize, size: usize },
    #[display("c {id} {count} {size}")]
    Callocate {
        id: usize,
        count: usize,
        size: usize,
    },
}

impl Op {
    #[must_use]
    pub fn id(&self) -> usize {
        match self {
            Self::Allocate { id, .. }
            | Self::Release { id }
            | Self::Reallocate { id, .. }
            | Self::Callocate { id, .. } => *id,
        }
    }
}

/// A request and the 1-based line it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub line: usize,
    pub op: Op,
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ParseTraceError {
    #[snafu(display("line {line}: unknown request `{op}`"))]
    UnknownOp {
        line: usize,
        op: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: missing {field}"))]
    MissingField {
        line: usize,
        field: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: invalid {field} `{value}`"))]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
        #[snafu(source)]
        source: ParseIntError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: unexpected `{value}` after the request"))]
    ExtraField {
        line: usize,
        value: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("line {line}: id {id} is too large"))]
    IdTooLarge {
        line: usize,
        id: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ParseTraceError {
    #[must_use]
    pub fn line(&self) -> usize {
        match self {
            Self::UnknownOp { line, .. }
            | Self::MissingField { line, .. }
            | Self::InvalidNumber { line, .. }
            | Self::ExtraField { line, .. }
            | Self::IdTooLarge { line, .. } => *line,
        }
    }

    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::UnknownOp { location, .. }
            | Self::MissingField { location, .. }
            | Self::InvalidNumber { location, .. }
            | Self::ExtraField { location, .. }
            | Self::IdTooLarge { location, .. } => *location,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum LoadTraceError {
    #[snafu(display("failed to read trace {}", path.display()))]
    Read {
        path: PathBuf,
        #[snafu(source)]
        source: io::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to parse trace {}", path.display()))]
    Parse {
        path: PathBuf,
        #[snafu(source)]
        source: ParseTraceError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl LoadTraceError {
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::Read { location, .. } | Self::Parse { location, .. } => *location,
        }
    }
}

/// A parsed trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    steps: Vec<Step>,
    id_count: usize,
}

impl Trace {
    pub fn load(path: &Path) -> Result<Self, LoadTraceError> {
        let text = fs::read_to_string(path).context(ReadSnafu { path })?;
        text.parse::<Self>().context(ParseSnafu { path })
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// One more than the largest id the trace uses.
    #[must_use]
    pub fn id_count(&self) -> usize {
        self.id_count
    }
}

impl FromStr for Trace {
    type Err = ParseTraceError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut trace = Self::default();
        for (index, text) in text.lines().enumerate() {
            let line = index + 1;
            if let Some(op) = parse_line(line, text)? {
                trace.id_count = trace.id_count.max(op.id() + 1);
                trace.steps.push(Step { line, op });
            }
        }
        Ok(trace)
    }
}

fn parse_line(line: usize, text: &str) -> Result<Option<Op>, ParseTraceError> {
    let text = text.split_once('#').map_or(text, |(request, _)| request);
    let mut fields = Fields {
        line,
        words: text.split_whitespace(),
    };
    let Some(kind) = fields.words.next() else {
        return Ok(None);
    };

    let op = match kind {
        "a" => Op::Allocate {
            id: fields.id()?,
            size: fields.number("size")?,
        },
        "f" => Op::Release { id: fields.id()? },
        "r" => Op::Reallocate {
            id: fields.id()?,
            size: fields.number("size")?,
        },
        "c" => Op::Callocate {
            id: fields.id()?,
            count: fields.number("count")?,
            size: fields.number("size")?,
        },
        _ => return UnknownOpSnafu { line, op: kind }.fail(),
    };
    fields.finish()?;
    Ok(Some(op))
}

struct Fields<'a> {
    line: usize,
    words: SplitWhitespace<'a>,
}

impl Fields<'_> {
    fn number(&mut self, field: &'static str) -> Result<usize, ParseTraceError> {
        let line = self.line;
        let value = self
            .words
            .next()
            .context(MissingFieldSnafu { line, field })?;
        value
            .parse::<usize>()
            .context(InvalidNumberSnafu { line, field, value })
    }

    fn id(&mut self) -> Result<usize, ParseTraceError> {
        let id = self.number("id")?;
        ensure!(id < MAX_ID, IdTooLargeSnafu { line: self.line, id });
        Ok(id)
    }

    fn finish(mut self) -> Result<(), ParseTraceError> {
        match self.words.next() {
            Some(value) => ExtraFieldSnafu {
                line: self.line,
                value,
            }
            .fail(),
            None => Ok(()),
        }
    }
}
