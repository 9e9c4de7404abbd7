//! Splitting of raw queries into parts and words

use crate::Gram;

/// Split a raw query into its comma-separated parts
///
/// Parts are trimmed, and parts that are left empty are dropped, so a query
/// made only of commas and blanks has no part at all.
pub fn split_parts(raw_query: &str) -> impl Iterator<Item = &str> {
    raw_query
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
}

/// Split a query part into words
///
/// Words are separated by runs of whitespace. They are kept as typed, glob
/// characters included: case folding only happens at query formulation time.
pub fn tokenize(part: &str) -> Vec<Gram> {
    part.split_whitespace().map(Gram::from).collect()
}
