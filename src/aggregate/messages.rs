//! Reading of the message dumps that stores are built from
//!
//! A dump is a headerless TSV file, optionally gzipped (`.gz` extension),
//! with one `timestamp<TAB>content` record per message. Timestamps are UTC
//! milliseconds since the Unix epoch, and messages come in timestamp order.
//!
//! Dumps carry no author or channel, so messages from bots and from private
//! or excluded channels must be filtered out before the dump is written.

use crate::{progress::ProgressTracker, Result};
use anyhow::Context;
use async_compression::tokio::bufread::GzipDecoder;
use csv_async::AsyncReaderBuilder;
use futures::{stream::BoxStream, StreamExt};
use serde::Deserialize;
use std::path::Path;
use tokio::{fs::File, io::AsyncRead};
use tokio_util::io::{ReaderStream, StreamReader};

/// Message from a dump
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct Message {
    /// Time at which the message was sent, in milliseconds since the epoch
    pub timestamp: i64,

    /// Text of the message
    pub content: Box<str>,
}

/// Size of a dump file, as tracked by the `bytes` tracker of [`read()`]
pub async fn dump_size(path: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("looking up message dump {}", path.display()))?;
    Ok(metadata.len())
}

/// Stream the messages of a dump
///
/// Progress is reported to `bytes` as file bytes are read, before
/// decompression.
pub async fn read(
    path: &Path,
    bytes: ProgressTracker,
) -> Result<BoxStream<'static, Result<Message>>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("opening message dump {}", path.display()))?;

    // Track how many input bytes have been read so far
    let raw_bytes = StreamReader::new(ReaderStream::new(file).map(move |res| {
        res.inspect(|bytes_block| {
            bytes.make_progress(bytes_block.len() as u64);
        })
    }));

    // Apply gzip decoder to compressed dumps
    let tsv_bytes: Box<dyn AsyncRead + Unpin + Send> =
        if path.extension().is_some_and(|extension| extension == "gz") {
            Box::new(GzipDecoder::new(raw_bytes))
        } else {
            Box::new(raw_bytes)
        };

    // Apply TSV decoder to uncompressed bytes
    let location = path.display().to_string();
    let messages = AsyncReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .create_deserializer(tsv_bytes)
        .into_deserialize::<Message>()
        .map(move |message| message.with_context(|| format!("reading a message from {location}")));
    Ok(messages.boxed())
}
