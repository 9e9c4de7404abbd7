//! Building an n-gram store from a message dump
//!
//! Aggregation takes two passes over the dump. The first one counts every
//! n-gram of the corpus to decide which ones are frequent enough to be kept.
//! The second one walks the messages month by month and records the relative
//! frequency of every kept n-gram within each month.

pub mod messages;
pub mod tokenize;

use self::messages::Message;
use crate::{
    config::Config,
    month::YearMonth,
    progress::{ProgressConfig, ProgressReport, ProgressTracker, Work},
    store, Result, MAX_NGRAM_WORDS,
};
use anyhow::Context;
use futures::TryStreamExt;
use rayon::prelude::*;
use rusqlite::{params, params_from_iter, types::Value, Connection};
use std::{cmp::Reverse, collections::HashMap, mem, path::Path, sync::Arc};
use tokio::task::JoinHandle;

/// Occurence counts of n-grams, keyed by space-separated text
type NgramCounts = HashMap<Box<str>, u64>;

/// Identifier of a kept n-gram in the store
type NgramId = i64;

/// What was written to the store
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AggregateSummary {
    /// Number of messages read from the dump
    pub messages: u64,

    /// Number of n-grams that were kept
    pub ngrams: usize,

    /// Number of months with at least one frequency row
    pub months: usize,

    /// Number of frequency rows
    pub frequencies: usize,
}

/// Build the store at `config.db` from the messages of `input`
///
/// Any pre-existing store at that location is replaced.
pub async fn aggregate(
    config: Arc<Config>,
    input: &Path,
    report: &ProgressReport,
) -> Result<AggregateSummary> {
    // Find out which n-grams are frequent enough to be kept
    let (counts, num_messages) = count_ngrams(&config, input, report).await?;
    log::info!(
        "Found {} distinct n-grams in {num_messages} messages",
        counts.len()
    );
    let kept = select_ngrams(counts, config.min_occurrences.get());
    log::info!(
        "Keeping {} n-grams that occur at least {} times",
        kept.len(),
        config.min_occurrences
    );
    let ids = kept
        .iter()
        .enumerate()
        .map(|(id, (ngram, _count))| (ngram.clone(), id as NgramId))
        .collect::<HashMap<_, _>>();
    let num_ngrams = kept.len();

    // Set up a fresh store and record the kept n-grams
    let conn = create_store(&config.db).await?;
    let recorded = report.add(
        "Recording n-grams",
        ProgressConfig::new(Work::Steps(num_ngrams as u64)),
    );
    let (conn, ()) = on_connection(conn, "recording n-grams", move |conn| {
        insert_ngrams(conn, &kept, &recorded)
    })
    .await?;

    // Record monthly frequencies
    let (conn, months, frequencies) =
        record_frequencies(&config, input, report, conn, Arc::new(ids)).await?;

    // Index the tables now that they are filled
    on_connection(conn, "indexing the store", |conn| store::create_indices(conn)).await?;
    Ok(AggregateSummary {
        messages: num_messages,
        ngrams: num_ngrams,
        months,
        frequencies,
    })
}

/// First pass: count the occurences of all n-grams of the dump
///
/// Also checks that messages come in chronological order, which the second
/// pass relies on.
async fn count_ngrams(
    config: &Config,
    input: &Path,
    report: &ProgressReport,
) -> Result<(NgramCounts, u64)> {
    let size = messages::dump_size(input).await?;
    let bytes = report.add("Counting n-grams", ProgressConfig::new(Work::Bytes(size)));
    let mut messages = messages::read(input, bytes).await?;

    // Count chunks of messages in the background while the next one is read
    let chunk_size = config.chunk.get();
    let mut chunk = Vec::with_capacity(chunk_size);
    let mut counting: JoinHandle<NgramCounts> = tokio::task::spawn_blocking(NgramCounts::new);
    let mut last_timestamp = i64::MIN;
    let mut num_messages = 0;
    loop {
        let message = messages.try_next().await?;
        let done = message.is_none();
        if let Some(Message { timestamp, content }) = message {
            anyhow::ensure!(
                timestamp >= last_timestamp,
                "time went backwards: message at {timestamp} comes after one at {last_timestamp}"
            );
            last_timestamp = timestamp;
            num_messages += 1;
            chunk.push(content);
        }
        if chunk.len() == chunk_size || (done && !chunk.is_empty()) {
            let contents = mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
            let counts = counting.await.context("counting n-grams")?;
            counting = tokio::task::spawn_blocking(move || add_counts(counts, &contents));
        }
        if done {
            break;
        }
    }
    let counts = counting.await.context("counting n-grams")?;
    Ok((counts, num_messages))
}

/// Add the n-gram occurences of some messages to existing counts
fn add_counts(counts: NgramCounts, contents: &[Box<str>]) -> NgramCounts {
    let chunk_counts = contents
        .par_iter()
        // First count n-grams on each thread...
        .fold(NgramCounts::new, |mut counts, content| {
            tokenize::for_each_ngram(content, |ngram| {
                *counts.entry(ngram.join(" ").into()).or_default() += 1;
            });
            counts
        })
        // ...then merge thread results into a global result
        .reduce(NgramCounts::new, merge_counts);
    merge_counts(counts, chunk_counts)
}

/// Merge two sets of n-gram counts
fn merge_counts(counts1: NgramCounts, counts2: NgramCounts) -> NgramCounts {
    let (mut dst, src) = if counts1.len() >= counts2.len() {
        (counts1, counts2)
    } else {
        (counts2, counts1)
    };
    for (ngram, count) in src {
        *dst.entry(ngram).or_default() += count;
    }
    dst
}

/// Number of words of a space-separated n-gram
fn width(ngram: &str) -> usize {
    ngram.split(' ').count()
}

/// Pick the n-grams that occur at least `min_occurrences` times, in id order
///
/// Ids are assigned by increasing width, then by decreasing count, with ties
/// broken by text so that the same dump always gives the same store.
fn select_ngrams(counts: NgramCounts, min_occurrences: u64) -> Vec<(Box<str>, u64)> {
    let mut kept = counts
        .into_par_iter()
        .filter(|(_ngram, count)| *count >= min_occurrences)
        .collect::<Vec<_>>();
    kept.par_sort_unstable_by(|(ngram1, count1), (ngram2, count2)| {
        (width(ngram1), Reverse(*count1), ngram1).cmp(&(width(ngram2), Reverse(*count2), ngram2))
    });
    kept
}

/// Replace whatever is at `path` with an empty store
async fn create_store(path: &Path) -> Result<Connection> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::warn!("Replacing existing n-gram store {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("removing old n-gram store {}", path.display()))
        }
    }
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        let conn = Connection::open(&path)
            .with_context(|| format!("creating n-gram store {}", path.display()))?;
        store::create_schema(&conn).context("creating the store tables")?;
        Ok::<_, anyhow::Error>(conn)
    })
    .await
    .context("creating the n-gram store")?
}

/// Run blocking work on the store connection
///
/// The connection is handed over to a blocking thread and given back once the
/// work is done.
async fn on_connection<T: Send + 'static>(
    mut conn: Connection,
    what: &'static str,
    work: impl FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
) -> Result<(Connection, T)> {
    tokio::task::spawn_blocking(move || {
        let result = work(&mut conn).context(what)?;
        Ok::<_, anyhow::Error>((conn, result))
    })
    .await
    .context(what)?
}

/// Record the kept n-grams in the `ngrams_<n>` tables
fn insert_ngrams(
    conn: &mut Connection,
    kept: &[(Box<str>, u64)],
    recorded: &ProgressTracker,
) -> rusqlite::Result<()> {
    let transaction = conn.transaction()?;
    {
        let mut statements = (1..=MAX_NGRAM_WORDS)
            .map(|width| {
                let columns = (0..width).map(|i| format!(", gram_{i}")).collect::<String>();
                let placeholders = ", ?".repeat(width);
                transaction.prepare(&format!(
                    "INSERT INTO ngrams_{width} (ngram_id{columns}, total) VALUES (?{placeholders}, ?)"
                ))
            })
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (id, (ngram, count)) in kept.iter().enumerate() {
            let grams = ngram.split(' ').collect::<Vec<_>>();
            let values = std::iter::once(Value::from(id as NgramId))
                .chain(grams.iter().map(|gram| Value::from(gram.to_string())))
                .chain(std::iter::once(Value::from(*count as i64)));
            statements[grams.len() - 1].execute(params_from_iter(values))?;
            recorded.make_progress(1);
        }
    }
    transaction.commit()
}

/// Frequency of an n-gram over one month
#[derive(Clone, Copy, Debug, PartialEq)]
struct FrequencyRow {
    months_since_epoch: i64,
    ngram_id: NgramId,
    frequency: f64,
}

/// Second pass: compute and record the monthly frequencies of kept n-grams
///
/// Returns the connection, the number of months and the number of rows.
async fn record_frequencies(
    config: &Config,
    input: &Path,
    report: &ProgressReport,
    mut conn: Connection,
    ids: Arc<HashMap<Box<str>, NgramId>>,
) -> Result<(Connection, usize, usize)> {
    let size = messages::dump_size(input).await?;
    let bytes = report.add(
        "Computing frequencies",
        ProgressConfig::new(Work::Bytes(size)),
    );
    let mut messages = messages::read(input, bytes).await?;

    let chunk_size = config.chunk.get();
    let mut chunk = Vec::with_capacity(chunk_size);
    let mut counter = MonthlyCounter::new(ids, config.epoch);
    let mut months = 0;
    let mut frequencies = 0;
    loop {
        let message = messages.try_next().await?;
        let done = message.is_none();
        chunk.extend(message);
        if chunk.len() < chunk_size && !done {
            continue;
        }

        // Count a chunk of messages, flushing every month that it completes
        let messages_chunk = mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
        let rows;
        (counter, rows) = tokio::task::spawn_blocking(move || {
            let mut rows = Vec::new();
            for message in &messages_chunk {
                counter.add(message, &mut rows)?;
            }
            if done {
                counter.flush(&mut rows);
            }
            Ok::<_, anyhow::Error>((counter, rows))
        })
        .await
        .context("computing frequencies")??;

        // Record the frequencies of completed months
        let num_rows = rows.len();
        let new_months = rows
            .windows(2)
            .filter(|pair| pair[0].months_since_epoch != pair[1].months_since_epoch)
            .count()
            + usize::from(!rows.is_empty());
        (conn, _) = on_connection(conn, "recording frequencies", move |conn| {
            insert_frequencies(conn, &rows)
        })
        .await?;
        months += new_months;
        frequencies += num_rows;
        if done {
            break;
        }
    }
    Ok((conn, months, frequencies))
}

/// Record rows of the `frequencies` table
fn insert_frequencies(conn: &mut Connection, rows: &[FrequencyRow]) -> rusqlite::Result<()> {
    let transaction = conn.transaction()?;
    {
        let mut statement = transaction.prepare(
            "INSERT INTO frequencies (months_since_epoch, ngram_id, frequency) VALUES (?1, ?2, ?3)",
        )?;
        for row in rows {
            statement.execute(params![row.months_since_epoch, row.ngram_id, row.frequency])?;
        }
    }
    transaction.commit()
}

/// Running occurence counts of kept n-grams over the current month
struct MonthlyCounter {
    /// Ids of the kept n-grams
    ids: Arc<HashMap<Box<str>, NgramId>>,

    /// Month that the store's month offsets count from
    epoch: YearMonth,

    /// Month being counted, if any message was seen yet
    month: Option<YearMonth>,

    /// Occurences of kept n-grams over the current month
    counts: HashMap<NgramId, u64>,

    /// Occurences of kept 1-grams over the current month
    total: u64,
}
//
impl MonthlyCounter {
    fn new(ids: Arc<HashMap<Box<str>, NgramId>>, epoch: YearMonth) -> Self {
        Self {
            ids,
            epoch,
            month: None,
            counts: HashMap::new(),
            total: 0,
        }
    }

    /// Count the n-grams of a message, flushing the previous month into
    /// `rows` if the message starts a new one
    fn add(&mut self, message: &Message, rows: &mut Vec<FrequencyRow>) -> Result<()> {
        let month = YearMonth::from_timestamp_millis(message.timestamp)
            .with_context(|| format!("message timestamp {} is out of range", message.timestamp))?;
        if self.month != Some(month) {
            self.flush(rows);
            self.month = Some(month);
        }
        let Self {
            ids, counts, total, ..
        } = self;
        tokenize::for_each_ngram(&message.content, |ngram| {
            if let Some(&id) = ids.get(ngram.join(" ").as_str()) {
                *counts.entry(id).or_default() += 1;
                if ngram.len() == 1 {
                    *total += 1;
                }
            }
        });
        Ok(())
    }

    /// Turn the counts of the current month into frequency rows
    fn flush(&mut self, rows: &mut Vec<FrequencyRow>) {
        let Some(month) = self.month else {
            return;
        };
        let total = mem::take(&mut self.total);
        if total == 0 {
            log::debug!("No kept n-gram was used in {month}, skipping it");
            self.counts.clear();
            return;
        }
        let months_since_epoch = month.months_since(self.epoch);
        let start = rows.len();
        rows.extend(self.counts.drain().map(|(ngram_id, count)| FrequencyRow {
            months_since_epoch,
            ngram_id,
            frequency: count as f64 / total as f64,
        }));
        rows[start..].sort_unstable_by_key(|row| row.ngram_id);
        log::debug!(
            "Recorded {} n-gram frequencies for {month}",
            rows.len() - start
        );
    }
}
