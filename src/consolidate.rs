//! Turning a query response into chart-ready records
//!
//! The chart wants one flat list of points, one per (series, month), with no
//! month missing in any series. Series order drives color and legend
//! assignment, so it is taken from the response as-is.

use crate::{
    month::YearMonth,
    query::{
        collect::{Entry, QueryResult},
        QueryResponse,
    },
    Result,
};
use anyhow::Context;
use serde::Serialize;

/// One point of the chart
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChartRecord {
    /// UTC timestamp of the start of the month, in milliseconds
    pub date: i64,

    /// Frequency of the series over that month
    pub frequency: f64,

    /// Label of the series this point belongs to
    pub series_label: Box<str>,
}

/// Months that every series must cover
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BucketRange {
    /// First month of the corpus
    pub first: YearMonth,

    /// Last month of the corpus, or `None` to use the latest month found in
    /// the response being consolidated
    pub last: Option<YearMonth>,
}

/// Consolidated response: series labels in legend order, and chart records
pub type Chart = (Vec<Box<str>>, Vec<ChartRecord>);

/// Merge, gap-fill and flatten the series of a query response
///
/// Series from later query parts come after those of earlier ones. A label
/// that shows up in several parts keeps its first position and gathers the
/// entries of all of them. The response itself is left untouched.
pub fn consolidate(response: &QueryResponse, buckets: BucketRange) -> Result<Chart> {
    // Flatten all parts into one ordered mapping
    let mut merged = response
        .series
        .iter()
        .flat_map(QueryResult::iter)
        .fold(QueryResult::new(), |mut merged, (label, entries)| {
            merged.extend_series(label, entries.iter().copied());
            merged
        });

    // Sort every series, then insert zeroes for the missing months
    let last = match buckets.last {
        Some(last) => last,
        None => latest_month(&merged)?.unwrap_or(buckets.first),
    };
    for entries in merged.entries_mut() {
        entries.sort_by_key(|entry| entry.year_month);
        *entries = fill_gaps(std::mem::take(entries), buckets.first, last)?;
    }

    // Pivot into chart records
    let labels = merged.labels().map(Box::from).collect();
    let records = merged
        .iter()
        .flat_map(|(label, entries)| {
            entries.iter().map(move |entry| ChartRecord {
                date: entry.year_month,
                frequency: entry.frequency,
                series_label: label.into(),
            })
        })
        .collect();
    Ok((labels, records))
}

/// Latest month that any series has an entry for
fn latest_month(result: &QueryResult) -> Result<Option<YearMonth>> {
    let mut latest = None;
    for (_, entries) in result.iter() {
        for entry in entries {
            latest = latest.max(Some(entry_month(entry)?));
        }
    }
    Ok(latest)
}

/// Month that an entry belongs to
fn entry_month(entry: &Entry) -> Result<YearMonth> {
    YearMonth::from_timestamp_millis(entry.year_month)
        .with_context(|| format!("entry timestamp {} is out of range", entry.year_month))
}

/// Give a chronologically sorted series one entry per month from `first` to
/// `last`, inserting zero-frequency entries where months are missing
///
/// Existing entries are all kept, including those outside of the range.
fn fill_gaps(entries: Vec<Entry>, first: YearMonth, last: YearMonth) -> Result<Vec<Entry>> {
    let zero = |month: YearMonth| Entry {
        year_month: month.timestamp_millis(),
        frequency: 0.0,
    };
    let mut filled = Vec::with_capacity(entries.len() + 12);
    let mut next_missing = Some(first).filter(|first| *first <= last);
    for entry in entries {
        let month = entry_month(&entry)?;
        while let Some(missing) = next_missing.filter(|missing| *missing < month) {
            filled.push(zero(missing));
            next_missing = missing.succ().filter(|next| *next <= last);
        }
        if next_missing == Some(month) {
            next_missing = month.succ().filter(|next| *next <= last);
        }
        filled.push(entry);
    }
    while let Some(missing) = next_missing {
        filled.push(zero(missing));
        next_missing = missing.succ().filter(|next| *next <= last);
    }
    Ok(filled)
}
