//! Grouping of raw store rows into labeled series

use crate::{month::YearMonth, store::Row, Result};
use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

/// Frequency of a series over one month
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Entry {
    /// UTC timestamp of the start of the month, in milliseconds
    pub year_month: i64,

    /// Relative frequency over that month
    pub frequency: f64,
}

/// Series of one query part, keyed by label
///
/// Labels keep the order in which they were first inserted. That order picks
/// the colors and legend of the chart, so it must never be re-sorted.
///
/// On the wire this is a list of `[label, entries]` pairs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    /// Series in first-insertion order
    series: Vec<(Box<str>, Vec<Entry>)>,

    /// Position of each label in `series`
    positions: HashMap<Box<str>, usize>,
}
//
impl QueryResult {
    /// Empty result
    pub fn new() -> Self {
        Self::default()
    }

    /// Append entries to a series, creating it at the end if it is new
    pub fn extend_series(&mut self, label: &str, entries: impl IntoIterator<Item = Entry>) {
        let position = match self.positions.get(label) {
            Some(&position) => position,
            None => {
                let label = Box::<str>::from(label);
                self.series.push((label.clone(), Vec::new()));
                self.positions.insert(label, self.series.len() - 1);
                self.series.len() - 1
            }
        };
        self.series[position].1.extend(entries);
    }

    /// Entries of a series, if present
    pub fn get(&self, label: &str) -> Option<&[Entry]> {
        let position = *self.positions.get(label)?;
        Some(&self.series[position].1)
    }

    /// Labels in insertion order
    pub fn labels(&self) -> impl Iterator<Item = &str> + '_ {
        self.series.iter().map(|(label, _)| &**label)
    }

    /// Series in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Entry])> + '_ {
        self.series
            .iter()
            .map(|(label, entries)| (&**label, &entries[..]))
    }

    /// Mutable access to the entries of every series, in insertion order
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut Vec<Entry>> + '_ {
        self.series.iter_mut().map(|(_, entries)| entries)
    }

    /// Number of series
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Truth that there is no series
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
//
impl FromIterator<(Box<str>, Vec<Entry>)> for QueryResult {
    fn from_iter<I: IntoIterator<Item = (Box<str>, Vec<Entry>)>>(iter: I) -> Self {
        let mut result = Self::new();
        for (label, entries) in iter {
            result.extend_series(&label, entries);
        }
        result
    }
}
//
impl Serialize for QueryResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(&self.series)
    }
}
//
impl<'de> Deserialize<'de> for QueryResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<(Box<str>, Vec<Entry>)>::deserialize(deserializer).map(Self::from_iter)
    }
}

/// Group the rows of a formulated query by n-gram
///
/// The label of a row is its `width` gram columns joined by single spaces.
/// Entries keep row order, and labels appear in the order of their first row.
pub fn collect(rows: Vec<Row>, width: usize, epoch: YearMonth) -> Result<QueryResult> {
    let mut result = QueryResult::new();
    let mut label = String::new();
    for row in rows {
        anyhow::ensure!(
            row.grams.len() == width,
            "expected {width} gram columns in a store row, found {}",
            row.grams.len()
        );
        label.clear();
        for (i, gram) in row.grams.iter().enumerate() {
            if i > 0 {
                label.push(' ');
            }
            label.push_str(gram);
        }
        let month = epoch.add_months(row.months_since_epoch).with_context(|| {
            format!(
                "month offset {} of {label:?} is out of the calendar's range",
                row.months_since_epoch
            )
        })?;
        result.extend_series(
            &label,
            [Entry {
                year_month: month.timestamp_millis(),
                frequency: row.frequency,
            }],
        );
    }
    Ok(result)
}
