//! Process configuration

use crate::{consolidate::BucketRange, month::YearMonth, Args, Command};
use std::{
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    sync::Arc,
};

/// Final process configuration
///
/// This is the digested form of [`Args`]. Please refer to [`Args`] to know
/// more about individual fields.
#[allow(missing_docs)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Location of the n-gram store
    pub db: PathBuf,

    /// Months that consolidated series must cover
    pub buckets: BucketRange,

    // Other fields have the same meaning as in Args
    pub pool_size: NonZeroU32,
    pub epoch: YearMonth,
    pub min_occurrences: NonZeroU64,
    pub chunk: NonZeroUsize,
}
//
impl Config {
    /// Determine process configuration, and the command to run with it
    pub(crate) fn new(args: Args) -> (Arc<Self>, Command) {
        let Args {
            db,
            pool_size,
            epoch,
            first_bucket,
            last_bucket,
            min_occurrences,
            chunk,
            command,
        } = args;
        let config = Arc::new(Self {
            db,
            buckets: BucketRange {
                first: first_bucket,
                last: last_bucket,
            },
            pool_size,
            epoch,
            min_occurrences,
            chunk,
        });
        (config, command)
    }
}
