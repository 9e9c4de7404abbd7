//! Usage statistics of words and phrases across a chat corpus, month by month
//!
//! The corpus is stored as SQLite tables of n-grams (sequences of one to
//! [`MAX_NGRAM_WORDS`] words) and of their monthly relative frequencies. This
//! program builds such a store from a message dump, and answers queries about
//! it in the format expected by the viewer's chart frontend.

mod aggregate;
mod config;
mod consolidate;
mod month;
mod progress;
mod query;
mod request;
mod store;

use crate::{
    config::Config,
    consolidate::{consolidate, BucketRange, ChartRecord},
    month::YearMonth,
    progress::ProgressReport,
    query::{formulate::QueryOptions, QueryEngine, Status},
    store::SqliteStore,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use serde::Serialize;
use std::{
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};

/// Query and build monthly n-gram frequency stores
///
/// Queries are comma-separated lists of parts, each of which is a sequence of
/// words. Words may contain `*` and `?` wildcards, which expand to the most
/// used matching n-grams.
#[derive(Parser, Debug)]
#[command(version, author)]
struct Args {
    /// Location of the n-gram store
    #[arg(long, default_value = "ngrams.db3")]
    db: PathBuf,

    /// Maximal number of store connections
    ///
    /// Every part of a query is resolved on its own connection, so there is
    /// little point in going above the maximal number of query parts.
    #[arg(long, default_value = "10")]
    pool_size: NonZeroU32,

    /// Month that the store's month offsets count from, as YYYY-MM
    ///
    /// This must be the epoch that the store was aggregated with.
    #[arg(long, default_value = "2017-01")]
    epoch: YearMonth,

    /// First month of the charted period, as YYYY-MM
    #[arg(long, default_value = "2017-07")]
    first_bucket: YearMonth,

    /// Last month of the charted period, as YYYY-MM
    ///
    /// By default, charts stop at the latest month that the store has
    /// frequencies for, so that every query is charted over the same period.
    #[arg(long)]
    last_bucket: Option<YearMonth>,

    /// Minimal number of occurences for an n-gram to be kept by aggregation
    ///
    /// Rare n-grams make for a large store that is slow to query, and their
    /// frequency curves are mostly noise.
    #[arg(short = 'm', long, default_value = "20")]
    min_occurrences: NonZeroU64,

    /// Number of messages that aggregation counts in one parallel batch
    ///
    /// If it is set too low, the overhead of spawning parallel tasks will not
    /// be properly amortized. If it is set too high, memory usage goes up.
    #[arg(long, default_value = "10000")]
    chunk: NonZeroUsize,

    #[command(subcommand)]
    command: Command,
}
//
impl Args {
    /// Decode and validate CLI arguments
    pub fn parse_and_check() -> Result<Self> {
        // Decode CLI arguments
        let args = Args::parse();

        // Check CLI arguments for basic sanity
        anyhow::ensure!(
            args.first_bucket >= args.epoch,
            "the charted period cannot start before the store's epoch"
        );
        if let Some(last_bucket) = args.last_bucket {
            anyhow::ensure!(
                last_bucket >= args.first_bucket,
                "the last charted month comes before the first one"
            );
        }
        Ok(args)
    }
}

/// Operation to be carried out
#[derive(Subcommand, Debug)]
enum Command {
    /// Answer a single query and print the response as JSON
    Query {
        /// Comma-separated query parts
        query: String,

        /// Match words regardless of case
        #[arg(long)]
        ci: bool,

        /// Sum all matches of each part into a single series
        #[arg(long)]
        combine: bool,

        /// Print chart-ready records instead of the raw response
        #[arg(long)]
        chart: bool,
    },

    /// Answer JSON requests from stdin, one per line, with JSON responses
    /// on stdout
    Batch,

    /// Build the n-gram store from a TSV message dump
    Aggregate {
        /// Message dump, with `.gz` extension if gzip-compressed
        messages: PathBuf,
    },
}

/// Output of `query --chart`
#[derive(Debug, Serialize)]
struct ChartOutput {
    labels: Vec<Box<str>>,
    records: Vec<ChartRecord>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// Run the requested command, returning the process exit code
async fn run() -> Result<ExitCode> {
    // Set up logging
    setup_logging().map_err(|e| anyhow::format_err!("{e}"))?;

    // Decode CLI arguments
    let args = Args::parse_and_check()?;
    let (config, command) = Config::new(args);

    match command {
        Command::Query {
            query,
            ci,
            combine,
            chart,
        } => {
            let (store, engine) = open_engine(&config)?;
            let options = QueryOptions {
                case_insensitive: ci,
                combine,
            };
            let outcome = engine.respond(&query, options).await;
            let output = if chart && outcome.status == Status::Succeeded {
                let buckets = chart_buckets(&config, &store)?;
                let (labels, records) = consolidate(&outcome.response, buckets)?;
                serde_json::to_vec(&ChartOutput { labels, records })
            } else {
                serde_json::to_vec(&outcome.response)
            }
            .context("encoding the response")?;
            write_stdout(&output).await?;
            Ok(match outcome.status {
                Status::Succeeded => ExitCode::SUCCESS,
                Status::Rejected => ExitCode::from(1),
                Status::Failed => ExitCode::from(2),
            })
        }
        Command::Batch => {
            let (_store, engine) = open_engine(&config)?;
            let stdin = BufReader::new(tokio::io::stdin());
            let stdout = BufWriter::new(tokio::io::stdout());
            let stats = request::serve_lines(&engine, stdin, stdout).await?;
            log::info!("Served {stats:?}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Aggregate { messages } => {
            let report = ProgressReport::new();
            let summary = aggregate::aggregate(config.clone(), &messages, &report).await?;
            log::info!("Aggregated {summary:?} into {}", config.db.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Open the store and set up a query engine around it
fn open_engine(config: &Config) -> Result<(Arc<SqliteStore>, QueryEngine<SqliteStore>)> {
    let store = Arc::new(SqliteStore::open(&config.db, config.pool_size.get())?);
    let engine = QueryEngine::new(store.clone(), config.epoch);
    Ok((store, engine))
}

/// Months to chart, the last one defaulting to the end of the corpus
fn chart_buckets(config: &Config, store: &SqliteStore) -> Result<BucketRange> {
    let mut buckets = config.buckets;
    if buckets.last.is_none() {
        if let Some(offset) = store.last_month_offset()? {
            let last = config.epoch.add_months(offset).with_context(|| {
                format!("latest month offset {offset} of the store is out of range")
            })?;
            buckets.last = Some(last);
        }
    }
    Ok(buckets)
}

/// Write a line of output on stdout
async fn write_stdout(line: &[u8]) -> Result<()> {
    let mut stdout = BufWriter::new(tokio::io::stdout());
    stdout.write_all(line).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

/// Use anyhow for Result type erasure
pub use anyhow::Result;

/// Maximal number of comma-separated parts in a query
pub const MAX_QUERY_PARTS: usize = 10;

/// Maximal number of words in an n-gram
pub const MAX_NGRAM_WORDS: usize = 5;

/// Number of most used n-grams that a wildcard query part expands to
pub const TOP_NGRAMS: usize = 10;

/// Single word of an n-gram, or query pattern for one
pub type Gram = Box<str>;

/// Set up logging
fn setup_logging() -> syslog::Result<()> {
    syslog::init(
        syslog::Facility::LOG_USER,
        if cfg!(feature = "log-trace") {
            LevelFilter::Trace
        } else if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
        None,
    )
}
