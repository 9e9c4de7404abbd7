//! Decoding of client requests and line-based request serving
//!
//! Requests carry the same parameters as the viewer's HTTP query string:
//! `q` for the raw query, and `ci`/`combine` set to `"true"` to enable the
//! matching [`QueryOptions`]. They are exchanged as one JSON object per line,
//! which lets an external HTTP frontend drive the engine.

use crate::{
    query::{formulate::QueryOptions, QueryEngine, Status},
    store::NgramStore,
    Result,
};
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Request whose shape makes it impossible to process
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RequestError {
    /// The request is not a JSON object
    #[error("Request isn't a JSON object")]
    Malformed,

    /// No `q` parameter
    #[error("Query is missing")]
    MissingQuery,

    /// A `q` parameter that is not a string
    #[error("Query isn't a string")]
    QueryNotString,
}

/// Raw request parameters
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct QueryParams {
    /// Raw query, expected to be a string
    #[serde(default)]
    pub q: Option<Value>,

    /// Case-insensitive matching flag
    #[serde(default)]
    pub ci: Option<Value>,

    /// Series combination flag
    #[serde(default)]
    pub combine: Option<Value>,
}
//
impl QueryParams {
    /// Extract the raw query and its options
    pub fn into_request(self) -> Result<(String, QueryOptions), RequestError> {
        let raw_query = match self.q {
            Some(Value::String(q)) => q,
            Some(_) => return Err(RequestError::QueryNotString),
            None => return Err(RequestError::MissingQuery),
        };
        let is_true = |flag: &Option<Value>| matches!(flag, Some(Value::String(s)) if s == "true");
        let options = QueryOptions {
            case_insensitive: is_true(&self.ci),
            combine: is_true(&self.combine),
        };
        Ok((raw_query, options))
    }
}

/// Decode a request line
pub fn parse_request(line: &str) -> Result<(String, QueryOptions), RequestError> {
    serde_json::from_str::<QueryParams>(line)
        .map_err(|_| RequestError::Malformed)?
        .into_request()
}

/// Tally of the requests served by [`serve_lines`]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ServeStats {
    /// Requests whose query was fully resolved
    pub succeeded: usize,

    /// Undecodable requests and queries that broke a limit
    pub rejected: usize,

    /// Requests that hit an internal error
    pub failed: usize,
}

/// Answer every JSON request line of `input` with a JSON response line
///
/// Requests that cannot be decoded, including lines that are not valid UTF-8,
/// are answered with `null` and do not reach the engine. Blank lines are
/// skipped.
pub async fn serve_lines<S: NgramStore>(
    engine: &QueryEngine<S>,
    mut input: impl AsyncBufRead + Unpin,
    mut output: impl AsyncWrite + Unpin,
) -> Result<ServeStats> {
    let mut stats = ServeStats::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let num_bytes = input
            .read_until(b'\n', &mut buf)
            .await
            .context("reading a request")?;
        if num_bytes == 0 {
            break;
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim_end_matches(&['\n', '\r'][..]),
            Err(e) => {
                log::error!("Rejected request that isn't valid UTF-8: {e}");
                stats.rejected += 1;
                write_reply(&mut output, b"null").await?;
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match parse_request(line) {
            Ok((raw_query, options)) => {
                let outcome = engine.respond(&raw_query, options).await;
                match outcome.status {
                    Status::Succeeded => stats.succeeded += 1,
                    Status::Rejected => stats.rejected += 1,
                    Status::Failed => stats.failed += 1,
                }
                serde_json::to_vec(&outcome.response).context("encoding a response")?
            }
            Err(e) => {
                log::error!("Rejected request {line:?}: {e}");
                stats.rejected += 1;
                b"null".to_vec()
            }
        };
        write_reply(&mut output, &reply).await?;
    }
    Ok(stats)
}

/// Write one response line
async fn write_reply(output: &mut (impl AsyncWrite + Unpin), reply: &[u8]) -> Result<()> {
    output.write_all(reply).await.context("writing a response")?;
    output.write_all(b"\n").await.context("writing a response")?;
    output.flush().await.context("writing a response")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        month::YearMonth,
        store::testing::{store, Fixture},
    };
    use std::sync::Arc;

    #[test]
    fn flags_are_only_set_by_the_true_string() {
        let (raw_query, options) = parse_request(r#"{"q": "a, b", "ci": "true"}"#).unwrap();
        assert_eq!(raw_query, "a, b");
        assert_eq!(
            options,
            QueryOptions {
                case_insensitive: true,
                combine: false
            }
        );
        let (_, options) =
            parse_request(r#"{"q": "a", "ci": true, "combine": "TRUE"}"#).unwrap();
        assert_eq!(options, QueryOptions::default());
    }

    #[test]
    fn badly_shaped_requests_are_refused() {
        assert_eq!(parse_request(r#"{"ci": "true"}"#), Err(RequestError::MissingQuery));
        assert_eq!(parse_request(r#"{"q": null}"#), Err(RequestError::MissingQuery));
        assert_eq!(parse_request(r#"{"q": 42}"#), Err(RequestError::QueryNotString));
        assert_eq!(parse_request(r#"{"q": ["a"]}"#), Err(RequestError::QueryNotString));
        assert_eq!(parse_request(r#""a""#), Err(RequestError::Malformed));
        assert_eq!(parse_request("q=a"), Err(RequestError::Malformed));
    }

    #[tokio::test]
    async fn every_request_line_gets_a_response_line() {
        let (_dir, store) = store(&[Fixture {
            words: &["hello"],
            total: 1,
            frequencies: &[(0, 0.5)],
        }]);
        let engine = QueryEngine::new(Arc::new(store), YearMonth::new(2017, 1).unwrap());
        let input = [
            r#"{"q": "hello"}"#,
            "",
            r#"{"q": 42}"#,
            r#"{"q": "a,b,c,d,e,f,g,h,i,j,k"}"#,
        ]
        .join("\n");
        let mut output = Vec::new();
        let stats = serve_lines(&engine, input.as_bytes(), &mut output)
            .await
            .unwrap();
        assert_eq!(
            stats,
            ServeStats {
                succeeded: 1,
                rejected: 2,
                failed: 0
            }
        );
        let output = String::from_utf8(output).unwrap();
        let lines = output.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        let first = serde_json::from_str::<Value>(lines[0]).unwrap();
        assert_eq!(first["series"][0][0][0], "hello");
        assert_eq!(lines[1], "null");
        let third = serde_json::from_str::<Value>(lines[2]).unwrap();
        assert_eq!(third["error"], "Query has too many parts (max 10)");
        assert_eq!(third["series"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn invalid_utf8_only_rejects_its_own_line() {
        let (_dir, store) = store(&[Fixture {
            words: &["hello"],
            total: 1,
            frequencies: &[(0, 0.5)],
        }]);
        let engine = QueryEngine::new(Arc::new(store), YearMonth::new(2017, 1).unwrap());
        let input: &[u8] = b"{\"q\": \"hello\"}\n{\"q\": \"\xff\"}\r\n{\"q\": \"hello\"}";
        let mut output = Vec::new();
        let stats = serve_lines(&engine, input, &mut output).await.unwrap();
        assert_eq!(
            stats,
            ServeStats {
                succeeded: 2,
                rejected: 1,
                failed: 0
            }
        );
        let output = String::from_utf8(output).unwrap();
        let lines = output.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "null");
        let answer = |line: &str| {
            let mut response = serde_json::from_str::<Value>(line).unwrap();
            response["time"] = 0.into();
            response
        };
        assert_eq!(answer(lines[0]), answer(lines[2]));
        assert_eq!(answer(lines[2])["series"][0][0][0], "hello");
    }
}
