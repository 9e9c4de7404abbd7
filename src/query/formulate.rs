//! Translation of a tokenized query part into SQL against the n-gram store
//!
//! Every n-gram width has its own `ngrams_<n>` table whose `gram_<i>` columns
//! hold the words, so a part of n words is matched column by column against
//! `ngrams_<n>`. Only the [`TOP_NGRAMS`] most popular matches (by their
//! `total` column) contribute series. When several matches have the same
//! `total` at the cutoff, which of them are kept depends on the storage order
//! and is not deterministic.

use crate::{Gram, Result, MAX_NGRAM_WORDS, TOP_NGRAMS};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// How a query part is matched and reported
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct QueryOptions {
    /// Compare lowercased words instead of exact ones
    pub case_insensitive: bool,

    /// Sum all matching n-grams into a single series labeled by the query part
    pub combine: bool,
}

/// Parameterized SQL for one query part
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FormulatedQuery {
    /// Query text, with `?N` placeholders
    pub sql: String,

    /// Values for the placeholders, in placeholder order
    pub params: Vec<Gram>,

    /// Number of words in the query part, which is also the number of
    /// `gram_<i>` columns in the output rows
    pub width: usize,
}

/// Build the SQL query that fetches the series of one query part
///
/// Separate mode yields one row per (matched n-gram, month), with the matched
/// words in the `gram_<i>` columns. Combine mode yields one row per month,
/// with the query's own words echoed in the `gram_<i>` columns and the sum of
/// the matches' frequencies.
pub fn formulate(part: &[Gram], options: QueryOptions) -> Result<FormulatedQuery> {
    let width = part.len();
    anyhow::ensure!(
        (1..=MAX_NGRAM_WORDS).contains(&width),
        "cannot formulate a query for a {width}-word part"
    );
    let table = format!("ngrams_{width}");
    let columns = (0..width).map(|i| format!("gram_{i}")).collect::<Vec<_>>();

    // One glob condition per word, bound to placeholders ?1..?n
    let conditions = columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let placeholder = i + 1;
            if options.case_insensitive {
                format!("casefold({table}.{column}) GLOB ?{placeholder}")
            } else {
                format!("{table}.{column} GLOB ?{placeholder}")
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    let mut params = part
        .iter()
        .map(|word| {
            if options.case_insensitive {
                word.to_lowercase().into()
            } else {
                word.clone()
            }
        })
        .collect::<Vec<Gram>>();

    let mut sql = String::new();
    if options.combine {
        // The labels are bound to ?n+1..?2n, after the match patterns
        let labels = (0..width)
            .map(|i| format!("?{} AS gram_{i}", width + i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            sql,
            "WITH top_ngrams AS (\
            \n    SELECT ngram_id\
            \n    FROM {table}\
            \n    WHERE {conditions}\
            \n    ORDER BY total DESC\
            \n    LIMIT {TOP_NGRAMS}\
            \n)\
            \nSELECT {labels},\
            \n    frequencies.months_since_epoch AS months_since_epoch,\
            \n    SUM(frequencies.frequency) AS frequency\
            \nFROM frequencies\
            \nINNER JOIN top_ngrams ON top_ngrams.ngram_id = frequencies.ngram_id\
            \nGROUP BY frequencies.months_since_epoch\
            \nORDER BY frequencies.months_since_epoch"
        )?;
        params.extend(part.iter().cloned());
    } else {
        let selected = columns
            .iter()
            .map(|column| format!("top_ngrams.{column} AS {column}"))
            .collect::<Vec<_>>()
            .join(", ");
        let ordering = columns
            .iter()
            .map(|column| format!("top_ngrams.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            sql,
            "WITH top_ngrams AS (\
            \n    SELECT ngram_id, {}\
            \n    FROM {table}\
            \n    WHERE {conditions}\
            \n    ORDER BY total DESC\
            \n    LIMIT {TOP_NGRAMS}\
            \n)\
            \nSELECT {selected},\
            \n    frequencies.months_since_epoch AS months_since_epoch,\
            \n    frequencies.frequency AS frequency\
            \nFROM frequencies\
            \nINNER JOIN top_ngrams ON top_ngrams.ngram_id = frequencies.ngram_id\
            \nORDER BY {ordering}, frequencies.months_since_epoch",
            columns.join(", ")
        )?;
    }
    log::trace!("Formulated query for {part:?} with {options:?}:\n{sql}");
    Ok(FormulatedQuery { sql, params, width })
}
