//! Single-shard data layer contract
//!
//! The router never speaks SQL. It drives one `ShardBackend` per shard
//! connection through a closed vocabulary of operations and outcomes, plus
//! a streaming variant used by the lazy shard iterator.

mod memory;

pub use memory::{MemoryBackend, MemoryConnector};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::error::BackendError;
use crate::model::{Filter, Record};

/// Stream of records produced by a shard scan
pub type RecordStream = BoxStream<'static, Result<Record, BackendError>>;

/// Table a single-shard call targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub primary_key: String,
}

/// One single-shard operation
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Find(Filter),
    FindOne(Filter),
    Count(Filter),
    FindAndCount(Filter),
    Exists(Filter),
    Insert(Record),
    InsertMany(Vec<Record>),
    FindOrInsert { filter: Filter, defaults: Record },
    Upsert(Record),
    Increment {
        fields: Vec<String>,
        by: i64,
        filter: Filter,
    },
    Update { values: Record, filter: Filter },
    Delete(Filter),
    Truncate,
}

impl Operation {
    /// Static operation name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Find(_) => "find",
            Operation::FindOne(_) => "find_one",
            Operation::Count(_) => "count",
            Operation::FindAndCount(_) => "find_and_count",
            Operation::Exists(_) => "exists",
            Operation::Insert(_) => "insert",
            Operation::InsertMany(_) => "insert_many",
            Operation::FindOrInsert { .. } => "find_or_insert",
            Operation::Upsert(_) => "upsert",
            Operation::Increment { .. } => "increment",
            Operation::Update { .. } => "update",
            Operation::Delete(_) => "delete",
            Operation::Truncate => "truncate",
        }
    }
}

/// Result of one single-shard operation, one variant per result shape
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rows(Vec<Record>),
    Row(Option<Record>),
    Count(u64),
    RowsAndCount { rows: Vec<Record>, count: u64 },
    Flag(bool),
    Written { record: Record, created: bool },
    Affected(u64),
    Done,
}

impl Outcome {
    fn kind(&self) -> &'static str {
        match self {
            Outcome::Rows(_) => "rows",
            Outcome::Row(_) => "row",
            Outcome::Count(_) => "count",
            Outcome::RowsAndCount { .. } => "rows_and_count",
            Outcome::Flag(_) => "flag",
            Outcome::Written { .. } => "written",
            Outcome::Affected(_) => "affected",
            Outcome::Done => "done",
        }
    }

    fn unexpected(&self, operation: &'static str) -> BackendError {
        BackendError::UnexpectedOutcome {
            operation,
            got: self.kind(),
        }
    }

    pub fn into_rows(self, operation: &'static str) -> Result<Vec<Record>, BackendError> {
        match self {
            Outcome::Rows(rows) => Ok(rows),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_row(self, operation: &'static str) -> Result<Option<Record>, BackendError> {
        match self {
            Outcome::Row(row) => Ok(row),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_count(self, operation: &'static str) -> Result<u64, BackendError> {
        match self {
            Outcome::Count(n) | Outcome::Affected(n) => Ok(n),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_rows_and_count(
        self,
        operation: &'static str,
    ) -> Result<(Vec<Record>, u64), BackendError> {
        match self {
            Outcome::RowsAndCount { rows, count } => Ok((rows, count)),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_flag(self, operation: &'static str) -> Result<bool, BackendError> {
        match self {
            Outcome::Flag(flag) => Ok(flag),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_written(self, operation: &'static str) -> Result<(Record, bool), BackendError> {
        match self {
            Outcome::Written { record, created } => Ok((record, created)),
            other => Err(other.unexpected(operation)),
        }
    }

    pub fn into_done(self, operation: &'static str) -> Result<(), BackendError> {
        match self {
            Outcome::Done => Ok(()),
            other => Err(other.unexpected(operation)),
        }
    }
}

/// One physical shard connection
#[async_trait]
pub trait ShardBackend: Send + Sync + 'static {
    /// Connection name, unique within a shard group
    fn name(&self) -> &str;

    /// Execute one operation against this shard
    async fn execute(&self, table: &TableRef, operation: Operation) -> Result<Outcome, BackendError>;

    /// Stream every record matching `filter`, one page in memory at a time.
    ///
    /// Backends with a native cursor should override this; the default pages
    /// through `execute(Find)` with limit/offset.
    fn scan(self: Arc<Self>, table: TableRef, filter: Filter, page_size: usize) -> RecordStream {
        paged_scan(self, table, filter, page_size)
    }

    /// Check the connection is usable
    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Release the connection
    async fn close(&self) {}
}

/// Turns connection configuration into a live backend
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn ShardBackend>, BackendError>;
}

struct PageCursor<B: ?Sized> {
    backend: Arc<B>,
    table: TableRef,
    filter: Filter,
    offset: usize,
    remaining: Option<usize>,
    page_size: usize,
    done: bool,
}

/// Page through a backend with limit/offset, honouring the filter's own window.
pub fn paged_scan<B>(backend: Arc<B>, table: TableRef, filter: Filter, page_size: usize) -> RecordStream
where
    B: ShardBackend + ?Sized,
{
    let cursor = PageCursor {
        backend,
        table,
        offset: filter.offset.unwrap_or(0),
        remaining: filter.limit,
        filter,
        page_size: page_size.max(1),
        done: false,
    };

    stream::unfold(cursor, |mut cursor| async move {
        if cursor.done {
            return None;
        }
        let want = cursor
            .remaining
            .map_or(cursor.page_size, |left| left.min(cursor.page_size));
        if want == 0 {
            return None;
        }

        let page = Filter {
            conditions: cursor.filter.conditions.clone(),
            order: cursor.filter.order.clone(),
            limit: Some(want),
            offset: Some(cursor.offset),
        };

        let result = cursor
            .backend
            .execute(&cursor.table, Operation::Find(page))
            .await
            .and_then(|outcome| outcome.into_rows("find"));

        let items: Vec<Result<Record, BackendError>> = match result {
            Ok(rows) => {
                if rows.len() < want {
                    cursor.done = true;
                }
                cursor.offset += rows.len();
                if let Some(left) = cursor.remaining.as_mut() {
                    *left = left.saturating_sub(rows.len());
                }
                rows.into_iter().map(Ok).collect()
            }
            Err(e) => {
                cursor.done = true;
                vec![Err(e)]
            }
        };

        Some((stream::iter(items), cursor))
    })
    .flatten()
    .boxed()
}
