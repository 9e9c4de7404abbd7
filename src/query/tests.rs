//! Query engine tests
//!
//! End-to-end checks of the pipeline against SQLite fixtures, plus ordering
//! and failure checks against synthetic stores with controlled behavior.

use super::{collect::Entry, *};
use crate::store::{
    testing::{store, Fixture},
    Row,
};
use super::formulate::FormulatedQuery;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

fn epoch() -> YearMonth {
    YearMonth::new(2017, 1).unwrap()
}

fn month(offset: i64) -> i64 {
    epoch().add_months(offset).unwrap().timestamp_millis()
}

fn separate() -> QueryOptions {
    QueryOptions::default()
}

fn combined() -> QueryOptions {
    QueryOptions {
        case_insensitive: false,
        combine: true,
    }
}

fn case_insensitive() -> QueryOptions {
    QueryOptions {
        case_insensitive: true,
        combine: false,
    }
}

/// Store that answers every query with one row echoing its first pattern,
/// after a delay that shrinks with the part's position in the query
#[derive(Debug, Default)]
struct SlowFirstStore {
    calls: AtomicUsize,
}
//
impl NgramStore for SlowFirstStore {
    fn execute(&self, query: &FormulatedQuery) -> Result<Vec<Row>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay: u64 = query.params[0].trim_start_matches('p').parse()?;
        std::thread::sleep(Duration::from_millis(10 * (10 - delay)));
        Ok(vec![Row {
            grams: query.params[..query.width].to_vec(),
            months_since_epoch: 0,
            frequency: delay as f64,
        }])
    }
}

/// Store that always fails
#[derive(Debug, Default)]
struct BrokenStore {
    calls: AtomicUsize,
}
//
impl NgramStore for BrokenStore {
    fn execute(&self, _query: &FormulatedQuery) -> Result<Vec<Row>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("no such table: ngrams_1 (secret schema detail)")
    }
}

fn engine<S: NgramStore>(store: S) -> QueryEngine<S> {
    QueryEngine::new(Arc::new(store), epoch())
}

#[test]
fn limits_are_checked_while_parsing() {
    assert_eq!(parse_query("a, b c").unwrap().len(), 2);
    let ten = vec!["w"; MAX_QUERY_PARTS].join(",");
    assert_eq!(parse_query(&ten).unwrap().len(), MAX_QUERY_PARTS);
    let eleven = vec!["w"; MAX_QUERY_PARTS + 1].join(",");
    assert_eq!(parse_query(&eleven), Err(QueryError::TooManyParts));
    // Empty parts do not count towards the limit
    assert_eq!(parse_query(&format!("{ten},, ,")).unwrap().len(), MAX_QUERY_PARTS);
    assert_eq!(
        parse_query("fine, one two  three four five six"),
        Err(QueryError::PartTooLong("one two three four five six".into()))
    );
}

#[tokio::test]
async fn results_follow_query_order_not_completion_order() {
    let engine = engine(SlowFirstStore::default());
    let raw_query = (0..MAX_QUERY_PARTS)
        .map(|i| format!("p{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let results = engine.handle_query(&raw_query, separate()).await.unwrap();
    let labels = results
        .iter()
        .map(|result| result.labels().collect::<Vec<_>>().join("|"))
        .collect::<Vec<_>>();
    let expected = (0..MAX_QUERY_PARTS)
        .map(|i| format!("p{i}"))
        .collect::<Vec<_>>();
    assert_eq!(labels, expected);
}

#[tokio::test]
async fn too_long_parts_never_reach_the_store() {
    let engine = engine(SlowFirstStore::default());
    let outcome = engine
        .respond("p1, p2 a b c d e", QueryOptions::default())
        .await;
    assert_eq!(outcome.status, Status::Rejected);
    assert_eq!(
        outcome.response.error.as_deref(),
        Some("Query part \"p2 a b c d e\" has too many words")
    );
    assert!(outcome.response.series.is_empty());
    assert_eq!(engine.store.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn too_many_parts_never_reach_the_store() {
    let engine = engine(SlowFirstStore::default());
    let outcome = engine.respond("p1,p2,p3,p4,p5,p6,p7,p8,p9,p0,p1", separate()).await;
    assert_eq!(outcome.status, Status::Rejected);
    assert_eq!(
        outcome.response.error.as_deref(),
        Some("Query has too many parts (max 10)")
    );
    assert_eq!(engine.store.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_query_is_not_an_error() {
    let engine = engine(BrokenStore::default());
    let outcome = engine.respond(" , ,,", separate()).await;
    assert_eq!(outcome.status, Status::Succeeded);
    assert_eq!(outcome.response.series, Vec::new());
    assert_eq!(outcome.response.error, None);
    assert_eq!(engine.store.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn store_failures_are_reported_without_details() {
    let engine = engine(BrokenStore::default());
    let outcome = engine.respond("fine, also fine", separate()).await;
    assert_eq!(outcome.status, Status::Failed);
    assert!(outcome.response.series.is_empty());
    assert_eq!(outcome.response.error.as_deref(), Some(INTERNAL_ERROR_MESSAGE));
    let json = serde_json::to_string(&outcome.response).unwrap();
    assert!(!json.contains("secret"));
}

fn corpus() -> Vec<Fixture<'static>> {
    vec![
        Fixture {
            words: &["The"],
            total: 100,
            frequencies: &[(6, 0.5), (7, 0.25)],
        },
        Fixture {
            words: &["the"],
            total: 300,
            frequencies: &[(6, 0.125), (8, 0.5)],
        },
        Fixture {
            words: &["THE"],
            total: 10,
            frequencies: &[(7, 0.0625)],
        },
        Fixture {
            words: &["cat"],
            total: 50,
            frequencies: &[(6, 0.25)],
        },
        Fixture {
            words: &["the", "cat"],
            total: 20,
            frequencies: &[(6, 0.125)],
        },
    ]
}

#[tokio::test]
async fn sqlite_round_trip_in_separate_mode() {
    let (_dir, store) = store(&corpus());
    let engine = engine(store);
    let results = engine
        .handle_query("the, cat, the cat, dog", separate())
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(
        results[0].get("the").unwrap(),
        [
            Entry {
                year_month: month(6),
                frequency: 0.125
            },
            Entry {
                year_month: month(8),
                frequency: 0.5
            },
        ]
    );
    assert_eq!(results[0].len(), 1);
    assert_eq!(results[1].labels().collect::<Vec<_>>(), ["cat"]);
    assert_eq!(results[2].labels().collect::<Vec<_>>(), ["the cat"]);
    assert!(results[3].is_empty());
}

#[tokio::test]
async fn case_insensitive_queries_ignore_query_case() {
    let (_dir, store) = store(&corpus());
    let engine = engine(store);
    let lower = engine.handle_query("the", case_insensitive()).await.unwrap();
    let upper = engine.handle_query("The", case_insensitive()).await.unwrap();
    assert_eq!(lower, upper);
    // Series of all three casings, in ascending n-gram text order
    assert_eq!(
        lower[0].labels().collect::<Vec<_>>(),
        ["THE", "The", "the"]
    );
}

#[tokio::test]
async fn combined_series_sum_the_separate_ones() {
    let (_dir, store) = store(&corpus());
    let engine = engine(store);
    let options = QueryOptions {
        case_insensitive: true,
        combine: false,
    };
    let separate = engine.handle_query("The", options).await.unwrap();
    let combined = engine
        .handle_query(
            "The",
            QueryOptions {
                combine: true,
                ..options
            },
        )
        .await
        .unwrap();

    // A single series, labeled by the query as typed
    assert_eq!(combined[0].labels().collect::<Vec<_>>(), ["The"]);
    let combined = combined[0].get("The").unwrap();
    for entry in combined {
        let expected = separate[0]
            .iter()
            .flat_map(|(_, entries)| entries)
            .filter(|separate| separate.year_month == entry.year_month)
            .map(|separate| separate.frequency)
            .sum::<f64>();
        assert_eq!(entry.frequency, expected);
    }
    let months = combined.iter().map(|entry| entry.year_month).collect::<Vec<_>>();
    assert_eq!(months, [month(6), month(7), month(8)]);
}

#[tokio::test]
async fn combine_mode_keeps_multi_word_labels() {
    let (_dir, store) = store(&corpus());
    let engine = engine(store);
    let results = engine.handle_query("the   c*", combined()).await.unwrap();
    assert_eq!(results[0].labels().collect::<Vec<_>>(), ["the c*"]);
}

#[tokio::test]
async fn only_the_ten_most_popular_matches_are_kept() {
    let words = (0..15).map(|i| format!("word{i:02}")).collect::<Vec<_>>();
    let words = words.iter().map(|word| [word.as_str()]).collect::<Vec<_>>();
    let fixtures = words
        .iter()
        .enumerate()
        .map(|(i, word)| Fixture {
            words: word,
            total: i as i64,
            frequencies: &[(0, 0.5)],
        })
        .collect::<Vec<_>>();
    let (_dir, store) = store(&fixtures);
    let engine = engine(store);
    let results = engine.handle_query("word*", separate()).await.unwrap();
    let labels = results[0].labels().collect::<Vec<_>>();
    assert_eq!(labels.len(), 10);
    // The five least popular ones are screened out
    assert!(labels.iter().all(|label| *label >= "word05"));
}

#[tokio::test]
async fn response_wire_format() {
    let (_dir, store) = store(&corpus());
    let engine = engine(store);
    let outcome = engine.respond("cat", separate()).await;
    assert_eq!(outcome.status, Status::Succeeded);
    let mut json = serde_json::to_value(&outcome.response).unwrap();
    assert!(json["time"].is_u64());
    json["time"] = 0.into();
    assert_eq!(
        json,
        serde_json::json!({
            "series": [[["cat", [{"year_month": month(6), "frequency": 0.25}]]]],
            "time": 0,
        })
    );
}
