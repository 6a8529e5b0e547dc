//! Lazy shard-by-shard iteration
//!
//! A facade stream drains shard 0 completely, then shard 1, and so on. The
//! next shard's scan is not opened until the previous one ends, so at most
//! one shard's page is buffered at any time. Shards are never interleaved.

use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::ShardError;
use crate::model::{Filter, Record};
use crate::shard::ShardLocalModel;

/// Records from one or more shards
pub type ShardStream = BoxStream<'static, Result<Record, ShardError>>;

/// Builds lazy record streams over shard-local bindings
pub struct LazyShardIterator {
    shards: Vec<ShardLocalModel>,
    page_size: usize,
}

impl LazyShardIterator {
    /// Iterate `shards` in the given (topology) order
    pub fn new(shards: Vec<ShardLocalModel>, page_size: usize) -> Self {
        Self { shards, page_size }
    }

    /// Stream every record matching `filter`. Ends early, without an error,
    /// once `cancel` fires.
    pub fn stream(self, filter: Filter, cancel: CancellationToken) -> ShardStream {
        let page_size = self.page_size;
        let shards = stream::iter(self.shards)
            .map(move |shard| shard.iterate_all(filter.clone(), page_size))
            .flatten();

        shards
            .take_until(async move { cancel.cancelled().await })
            .boxed()
    }
}
