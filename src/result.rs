//! Combinators over sequences of [`Result`]s.
//!
//! `collect` is all-or-nothing: the first error wins. `partition` never
//! fails and is the building block for graceful degradation, where a caller
//! serves whatever subset of work succeeded.

use crate::{Result, VisionError};

/// Outcome of [`partition`]: successes and failures split into two ordered
/// groups.
#[derive(Debug, Clone, Default)]
pub struct Partitioned<T> {
    pub successes: Vec<T>,
    pub failures: Vec<VisionError>,
}

/// Turn an ordered sequence of results into one result holding the ordered
/// values, failing on the first error encountered.
pub fn collect<T>(results: impl IntoIterator<Item = Result<T>>) -> Result<Vec<T>> {
    let iter = results.into_iter();
    let mut values = Vec::with_capacity(iter.size_hint().0);
    for result in iter {
        values.push(result?);
    }
    Ok(values)
}

/// Split an ordered sequence of results into successes and failures.
///
/// Relative order is preserved within each group. Always succeeds.
pub fn partition<T>(results: impl IntoIterator<Item = Result<T>>) -> Partitioned<T> {
    let mut partitioned = Partitioned {
        successes: Vec::new(),
        failures: Vec::new(),
    };
    for result in results {
        match result {
            Ok(value) => partitioned.successes.push(value),
            Err(err) => partitioned.failures.push(err),
        }
    }
    partitioned
}

impl<T> Partitioned<T> {
    /// True when no result failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}
