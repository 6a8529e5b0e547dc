//! Process-local shard backend
//!
//! Holds each table as a vector of records behind a `DashMap`. Used in
//! local mode (`memory://` URLs) and by the test suites. Writes to one
//! table are serialized by the map's shard lock.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::{Connector, Operation, Outcome, ShardBackend, TableRef};
use crate::config::ConnectionConfig;
use crate::error::BackendError;
use crate::model::{Filter, Record};

/// URL scheme served by `MemoryConnector`
pub const MEMORY_SCHEME: &str = "memory://";

/// In-memory single-shard store
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    tables: DashMap<String, Vec<Record>>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of rows currently stored in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |rows| rows.len())
    }

    /// Snapshot of a table's rows in insertion order
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables
            .get(table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Connection {
                shard: self.name.clone(),
                reason: "connection closed".to_string(),
            });
        }
        Ok(())
    }

    fn read<T>(&self, table: &str, f: impl FnOnce(&[Record]) -> T) -> T {
        match self.tables.get(table) {
            Some(rows) => f(&rows),
            None => f(&[]),
        }
    }

    fn write<T>(&self, table: &str, f: impl FnOnce(&mut Vec<Record>) -> T) -> T {
        let mut rows = self.tables.entry(table.to_string()).or_default();
        f(&mut rows)
    }
}

fn matching(rows: &[Record], filter: &Filter) -> Vec<Record> {
    rows.iter().filter(|r| filter.matches(r)).cloned().collect()
}

fn has_key(record: &Record, key: &str) -> bool {
    record.get(key).is_some_and(|v| !v.is_null())
}

fn position_of(rows: &[Record], pk: &str, value: &Value) -> Option<usize> {
    let filter = Filter::by(pk, value.clone());
    rows.iter().position(|r| filter.matches(r))
}

/// Insert one record, assigning the next integer id when the primary key is absent.
fn insert_row(rows: &mut Vec<Record>, table: &TableRef, mut record: Record) -> Result<Record, BackendError> {
    let pk = &table.primary_key;
    match record.get(pk).filter(|v| !v.is_null()) {
        Some(value) => {
            if position_of(rows, pk, value).is_some() {
                return Err(BackendError::ConstraintViolation {
                    table: table.table.clone(),
                    detail: format!("duplicate {pk} {value}"),
                });
            }
        }
        None => {
            let next = rows
                .iter()
                .filter_map(|r| r.get(pk).and_then(Value::as_i64))
                .max()
                .unwrap_or(0)
                .checked_add(1)
                .ok_or_else(|| BackendError::ConstraintViolation {
                    table: table.table.clone(),
                    detail: format!("no {pk} left to assign"),
                })?;
            record.insert(pk.clone(), Value::from(next));
        }
    }
    rows.push(record.clone());
    Ok(record)
}

fn increment_rows(
    rows: &mut [Record],
    table: &TableRef,
    fields: &[String],
    by: i64,
    filter: &Filter,
) -> Result<u64, BackendError> {
    // Compute every new value before writing so a bad field or an overflow
    // leaves the table as it was.
    let mut updates = Vec::new();
    for (index, row) in rows.iter().enumerate().filter(|(_, r)| filter.matches(r)) {
        let mut next = Vec::with_capacity(fields.len());
        for field in fields {
            let current = match row.get(field) {
                None | Some(Value::Null) => 0,
                Some(v) => v.as_i64().ok_or_else(|| BackendError::ConstraintViolation {
                    table: table.table.clone(),
                    detail: format!("cannot increment non-integer {field} = {v}"),
                })?,
            };
            let value = current.checked_add(by).ok_or_else(|| BackendError::ConstraintViolation {
                table: table.table.clone(),
                detail: format!("{field} = {current} overflows when incremented by {by}"),
            })?;
            next.push((field.clone(), value));
        }
        updates.push((index, next));
    }

    let affected = updates.len() as u64;
    for (index, next) in updates {
        for (field, value) in next {
            rows[index].insert(field, Value::from(value));
        }
    }
    Ok(affected)
}

#[async_trait]
impl ShardBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, table: &TableRef, operation: Operation) -> Result<Outcome, BackendError> {
        self.ensure_open()?;
        debug!(shard = %self.name, table = %table.table, operation = operation.name(), "Executing");

        let t = table.table.as_str();
        let outcome = match operation {
            Operation::Find(filter) => {
                Outcome::Rows(self.read(t, |rows| filter.apply_window(matching(rows, &filter))))
            }
            Operation::FindOne(filter) => {
                let filter = filter.limit(1);
                Outcome::Row(self.read(t, |rows| {
                    filter.apply_window(matching(rows, &filter)).into_iter().next()
                }))
            }
            Operation::Count(filter) => {
                Outcome::Count(self.read(t, |rows| rows.iter().filter(|r| filter.matches(r)).count()) as u64)
            }
            Operation::FindAndCount(filter) => self.read(t, |rows| {
                let all = matching(rows, &filter);
                let count = all.len() as u64;
                Outcome::RowsAndCount {
                    rows: filter.apply_window(all),
                    count,
                }
            }),
            Operation::Exists(filter) => {
                Outcome::Flag(self.read(t, |rows| rows.iter().any(|r| filter.matches(r))))
            }
            Operation::Insert(record) => {
                let record = self.write(t, |rows| insert_row(rows, table, record))?;
                Outcome::Written { record, created: true }
            }
            Operation::InsertMany(records) => self.write(t, |rows| {
                // All-or-nothing: stage on a copy.
                let mut staged = rows.clone();
                let mut inserted = Vec::with_capacity(records.len());
                for record in records {
                    inserted.push(insert_row(&mut staged, table, record)?);
                }
                *rows = staged;
                Ok::<_, BackendError>(Outcome::Rows(inserted))
            })?,
            Operation::FindOrInsert { filter, defaults } => self.write(t, |rows| {
                if let Some(found) = rows.iter().find(|r| filter.matches(r)) {
                    return Ok::<_, BackendError>(Outcome::Written {
                        record: found.clone(),
                        created: false,
                    });
                }
                let mut record = defaults;
                record.extend(filter.equality_values());
                let record = insert_row(rows, table, record)?;
                Ok(Outcome::Written { record, created: true })
            })?,
            Operation::Upsert(record) => self.write(t, |rows| {
                let pk = &table.primary_key;
                let existing = record
                    .get(pk)
                    .filter(|v| !v.is_null())
                    .and_then(|value| position_of(rows, pk, value));
                match existing {
                    Some(index) => {
                        rows[index].extend(record);
                        Ok::<_, BackendError>(Outcome::Written {
                            record: rows[index].clone(),
                            created: false,
                        })
                    }
                    None => {
                        let record = insert_row(rows, table, record)?;
                        Ok(Outcome::Written { record, created: true })
                    }
                }
            })?,
            Operation::Increment { fields, by, filter } => {
                Outcome::Affected(self.write(t, |rows| increment_rows(rows, table, &fields, by, &filter))?)
            }
            Operation::Update { values, filter } => self.write(t, |rows| {
                let pk = &table.primary_key;
                if let Some(new_pk) = values.get(pk) {
                    let clash = rows
                        .iter()
                        .any(|r| !filter.matches(r) && r.get(pk) == Some(new_pk));
                    if clash {
                        return Err(BackendError::ConstraintViolation {
                            table: table.table.clone(),
                            detail: format!("duplicate {pk} {new_pk}"),
                        });
                    }
                }
                let mut affected = 0;
                for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                    row.extend(values.clone());
                    affected += 1;
                }
                Ok(Outcome::Affected(affected))
            })?,
            Operation::Delete(filter) => self.write(t, |rows| {
                let before = rows.len();
                rows.retain(|r| !filter.matches(r));
                Outcome::Affected((before - rows.len()) as u64)
            }),
            Operation::Truncate => {
                self.write(t, |rows| rows.clear());
                Outcome::Done
            }
        };

        Ok(outcome)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.ensure_open()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(shard = %self.name, "Memory shard closed");
        }
    }
}

/// Connector for `memory://<name>` URLs
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryConnector;

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn ShardBackend>, BackendError> {
        if !config.url.starts_with(MEMORY_SCHEME) {
            return Err(BackendError::Connection {
                shard: config.name.clone(),
                reason: format!("no driver for {}", config.url),
            });
        }
        Ok(Arc::new(MemoryBackend::new(config.name.clone())))
    }
}
