//! Query engine: from a raw multi-part query to per-part series
//!
//! A raw query is a comma-separated list of parts, each part being one to
//! [`MAX_NGRAM_WORDS`] words. Every part is tokenized, formulated into SQL,
//! executed against the store and collected into a [`QueryResult`]. Parts are
//! processed concurrently, but results always come back in query order.

pub mod collect;
pub mod formulate;
pub mod tokenize;

use self::{
    collect::QueryResult,
    formulate::{formulate, QueryOptions},
};
use crate::{month::YearMonth, store::NgramStore, Gram, Result, MAX_NGRAM_WORDS, MAX_QUERY_PARTS};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};
use tokio::task::JoinSet;

/// Message sent in place of the details of an internal failure
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal error";

/// Problem with the query itself, reported to the user as-is
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum QueryError {
    /// More parts than the engine accepts
    #[error("Query has too many parts (max {MAX_QUERY_PARTS})")]
    TooManyParts,

    /// A part with more words than the widest n-gram table
    #[error("Query part \"{0}\" has too many words")]
    PartTooLong(Box<str>),
}

/// Per-part results of a query, as sent to the client
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct QueryResponse {
    /// One result per query part, in query order
    pub series: Vec<QueryResult>,

    /// Wall-clock processing time in milliseconds
    pub time: u64,

    /// User-facing error message, if the query failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a query ended
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Status {
    /// All parts were resolved
    Succeeded,

    /// The query broke a domain limit, see [`QueryError`]
    Rejected,

    /// Something went wrong on our side
    Failed,
}

/// Final state of a query: its status and the response to send
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    /// How the query ended
    pub status: Status,

    /// Response to send back to the client
    pub response: QueryResponse,
}

/// Split a raw query into tokenized parts and check them against the limits
pub fn parse_query(raw_query: &str) -> Result<Vec<Vec<Gram>>, QueryError> {
    let parts = tokenize::split_parts(raw_query)
        .map(tokenize::tokenize)
        .collect::<Vec<_>>();
    if parts.len() > MAX_QUERY_PARTS {
        return Err(QueryError::TooManyParts);
    }
    if let Some(part) = parts.iter().find(|part| part.len() > MAX_NGRAM_WORDS) {
        return Err(QueryError::PartTooLong(part.join(" ").into()));
    }
    Ok(parts)
}

/// Resolves queries against a shared n-gram store
#[derive(Debug)]
pub struct QueryEngine<S> {
    /// Store, shared by all concurrently running parts
    store: Arc<S>,

    /// Month that the store's month offsets count from
    epoch: YearMonth,
}
//
impl<S> Clone for QueryEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            epoch: self.epoch,
        }
    }
}
//
impl<S: NgramStore> QueryEngine<S> {
    /// Set up the engine
    pub fn new(store: Arc<S>, epoch: YearMonth) -> Self {
        Self { store, epoch }
    }

    /// Resolve every part of a raw query, in query order
    ///
    /// Limit violations come out as a [`QueryError`] inside the error, before
    /// the store is touched. Any failure of any part fails the whole query.
    pub async fn handle_query(
        &self,
        raw_query: &str,
        options: QueryOptions,
    ) -> Result<Vec<QueryResult>> {
        let parts = parse_query(raw_query)?;
        let num_parts = parts.len();

        // Resolve all parts concurrently...
        let mut tasks = JoinSet::new();
        for (position, part) in parts.into_iter().enumerate() {
            let store = self.store.clone();
            let epoch = self.epoch;
            tasks.spawn_blocking(move || {
                resolve_part(&*store, &part, options, epoch)
                    .with_context(|| format!("resolving query part {:?}", part.join(" ")))
                    .map(|result| (position, result))
            });
        }

        // ...and put each result back at its part's position
        let mut results = (0..num_parts).map(|_| None).collect::<Vec<_>>();
        while let Some(joined) = tasks.join_next().await {
            let (position, result) = joined.context("waiting for a query part")??;
            results[position] = Some(result);
        }
        results
            .into_iter()
            .map(|result| result.context("a query part did not report back"))
            .collect()
    }

    /// Resolve a raw query into the response to send back
    ///
    /// User errors keep their message, internal failures are logged here and
    /// only reported as [`INTERNAL_ERROR_MESSAGE`].
    pub async fn respond(&self, raw_query: &str, options: QueryOptions) -> Outcome {
        let start = Instant::now();
        log::info!("Received query {raw_query:?} with {options:?}");
        let result = self.handle_query(raw_query, options).await;
        let time = start.elapsed().as_millis() as u64;
        match result {
            Ok(series) => {
                log::debug!("Finished query {raw_query:?} in {time} ms");
                Outcome {
                    status: Status::Succeeded,
                    response: QueryResponse {
                        series,
                        time,
                        error: None,
                    },
                }
            }
            Err(e) => {
                let (status, message) = if let Some(query_error) = e.downcast_ref::<QueryError>() {
                    log::debug!("QueryError: {query_error}");
                    (Status::Rejected, query_error.to_string())
                } else {
                    log::error!("Error while handling query {raw_query:?}: {e:#}");
                    (Status::Failed, INTERNAL_ERROR_MESSAGE.to_owned())
                };
                Outcome {
                    status,
                    response: QueryResponse {
                        series: Vec::new(),
                        time,
                        error: Some(message),
                    },
                }
            }
        }
    }
}

/// Formulate, execute and collect a single query part
fn resolve_part(
    store: &impl NgramStore,
    part: &[Gram],
    options: QueryOptions,
    epoch: YearMonth,
) -> Result<QueryResult> {
    let query = formulate(part, options)?;
    let rows = store.execute(&query)?;
    collect::collect(rows, query.width, epoch)
}

#[cfg(test)]
mod tests;
