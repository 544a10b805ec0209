//! Top-level error type and an error-chain printer.

use core::{error::Error, fmt, iter};

use snafu::Snafu;
use tagalloc::{ArenaError, CheckError, HeapError, Location};

use crate::{
    color::{Color, WithFg},
    replay::ReplayError,
    trace::{LoadTraceError, ParseTraceError},
};

#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: Location,
    #[snafu(source(from(Box<dyn Error>, Some)))]
    source: Option<Box<dyn Error>>,
}

impl GenericError {
    #[must_use]
    pub fn location(&self) -> Location {
        self.location
    }
}

/// Where `error` was raised, for the error types this crate knows about.
fn location_of(error: &(dyn Error + 'static)) -> Option<Location> {
    error
        .downcast_ref()
        .map(GenericError::location)
        .or_else(|| error.downcast_ref().map(LoadTraceError::location))
        .or_else(|| error.downcast_ref().map(ParseTraceError::location))
        .or_else(|| error.downcast_ref().map(ReplayError::location))
        .or_else(|| error.downcast_ref().map(HeapError::location))
        .or_else(|| error.downcast_ref().map(CheckError::location))
        .or_else(|| error.downcast_ref().map(ArenaError::location))
}

/// Prints an error, where it was raised, and every error that caused it.
pub struct Report<E> {
    error: E,
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error: ")?;
        write_entry(f, &self.error, 2)?;

        let causes = iter::successors(self.error.source(), |&cause| cause.source());
        for (index, cause) in causes.enumerate() {
            if index == 0 {
                writeln!(f, "\nCaused by:")?;
            }
            write!(f, "{index:4}: ")?;
            write_entry(f, cause, 6)?;
        }
        Ok(())
    }
}

/// One error line, then its location indented by `indent` columns.
fn write_entry(
    f: &mut fmt::Formatter<'_>,
    error: &(dyn Error + 'static),
    indent: usize,
) -> fmt::Result {
    writeln!(f, "{}", WithFg::new(Color::Red, error))?;
    if let Some(location) = location_of(error) {
        writeln!(
            f,
            "{:indent$}at {}",
            "",
            WithFg::new(Color::DarkGray, location)
        )?;
    }
    Ok(())
}
