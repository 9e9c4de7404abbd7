//! SQLite n-gram store
//!
//! The store holds one `ngrams_<n>` table per n-gram width and a shared
//! `frequencies` table of monthly frequencies. The query path only ever reads
//! it, through a pool of read-only connections that is opened once at startup
//! and handed to the query engine.

use crate::{query::formulate::FormulatedQuery, Gram, Result, MAX_NGRAM_WORDS};
use anyhow::Context;
use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{functions::FunctionFlags, params_from_iter, Connection, OpenFlags};
use std::path::Path;

/// Raw output row of a formulated query
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    /// Contents of the `gram_<i>` columns
    pub grams: Vec<Gram>,

    /// Month of the frequency, as an offset from the corpus epoch
    pub months_since_epoch: i64,

    /// Relative frequency of the n-gram over that month
    pub frequency: f64,
}

/// Something that can run formulated queries
///
/// Implementations are shared across concurrently running query parts and
/// are called from blocking threads.
pub trait NgramStore: Send + Sync + 'static {
    /// Run a query and return all of its rows
    ///
    /// A query that matches nothing returns no rows; this is not an error.
    fn execute(&self, query: &FormulatedQuery) -> Result<Vec<Row>>;
}

/// Read-only SQLite store behind a connection pool
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}
//
impl SqliteStore {
    /// Open an existing store
    pub fn open(path: &Path, max_connections: u32) -> Result<Self> {
        anyhow::ensure!(
            path.is_file(),
            "n-gram store {} does not exist",
            path.display()
        );
        let manager = SqliteConnectionManager::file(path).with_flags(
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        );
        let pool = Pool::builder()
            .max_size(max_connections)
            .connection_customizer(Box::new(CaseFolding))
            .build(manager)
            .with_context(|| format!("opening n-gram store {}", path.display()))?;
        log::info!(
            "Opened n-gram store {} with up to {max_connections} connections",
            path.display()
        );
        Ok(Self { pool })
    }

    /// Latest month that the store has frequencies for, as an offset from the
    /// corpus epoch, or `None` if the store has no frequencies at all
    pub fn last_month_offset(&self) -> Result<Option<i64>> {
        let conn = self
            .pool
            .get()
            .context("acquiring an n-gram store connection")?;
        conn.query_row(
            "SELECT MAX(months_since_epoch) FROM frequencies",
            [],
            |row| row.get(0),
        )
        .context("looking up the latest month of the n-gram store")
    }
}
//
impl NgramStore for SqliteStore {
    fn execute(&self, query: &FormulatedQuery) -> Result<Vec<Row>> {
        let conn = self
            .pool
            .get()
            .context("acquiring an n-gram store connection")?;
        let mut statement = conn
            .prepare_cached(&query.sql)
            .context("preparing an n-gram query")?;
        let columns = (0..query.width)
            .map(|i| format!("gram_{i}"))
            .collect::<Vec<_>>();
        let rows = statement
            .query_map(params_from_iter(query.params.iter().map(|param| &**param)), |row| {
                let grams = columns
                    .iter()
                    .map(|column| Ok(row.get::<_, String>(column.as_str())?.into()))
                    .collect::<rusqlite::Result<Vec<Gram>>>()?;
                Ok(Row {
                    grams,
                    months_since_epoch: row.get("months_since_epoch")?,
                    frequency: row.get("frequency")?,
                })
            })
            .context("running an n-gram query")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading n-gram query results")?;
        log::trace!("Query with {:?} returned {} rows", query.params, rows.len());
        Ok(rows)
    }
}

/// Registers [`register_casefold`] on every pooled connection
#[derive(Debug)]
struct CaseFolding;
//
impl CustomizeConnection<Connection, rusqlite::Error> for CaseFolding {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        register_casefold(conn)
    }
}

/// Register the `casefold(text)` SQL function
///
/// SQLite's own `LOWER()` only folds ASCII letters, while query parameters are
/// lowercased on the Rust side with full Unicode rules. Both sides of a
/// case-insensitive comparison must go through the same routine.
pub fn register_casefold(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "casefold",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|text| text.to_lowercase())),
    )
}

/// Create the empty store tables
pub fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE frequencies (months_since_epoch INTEGER, ngram_id INTEGER, frequency REAL);",
    )?;
    for width in 1..=MAX_NGRAM_WORDS {
        let columns = (0..width)
            .map(|i| format!("gram_{i} TEXT"))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            "CREATE TABLE ngrams_{width} (ngram_id INTEGER PRIMARY KEY, {columns}, total INTEGER);"
        ))?;
    }
    Ok(())
}

/// Create the lookup indices, once the tables are filled
pub fn create_indices(conn: &Connection) -> rusqlite::Result<()> {
    for width in 1..=MAX_NGRAM_WORDS {
        conn.execute_batch(&format!(
            "CREATE INDEX ngrams_{width}_ngram_id ON ngrams_{width}(ngram_id);"
        ))?;
        for i in 0..width {
            conn.execute_batch(&format!(
                "CREATE INDEX ngrams_{width}_gram_{i} ON ngrams_{width}(gram_{i});"
            ))?;
        }
        conn.execute_batch(&format!(
            "CREATE INDEX ngrams_{width}_total ON ngrams_{width}(total);"
        ))?;
    }
    conn.execute_batch(
        "CREATE INDEX frequencies_ngram_id ON frequencies(ngram_id);
         CREATE INDEX frequencies_months_since_epoch ON frequencies(months_since_epoch);",
    )
}
