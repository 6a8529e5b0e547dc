//! Shard-local model bindings
//!
//! A `ShardLocalModel` is one model bound to one physical shard. It carries
//! its connection as a field, so two bindings of the same model never share
//! or repoint each other's connection. Every call goes straight to the
//! single-shard backend with no routing logic.

use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use super::key::{DistributionKeyResolver, ShardKey};
use crate::backend::{Operation, Outcome, ShardBackend, TableRef};
use crate::error::{BackendError, ShardError};
use crate::metrics;
use crate::model::{Filter, ModelDeclaration, Record};
use crate::router::ShardStream;

/// Rows of a window plus the total number of matching rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindAndCount {
    pub rows: Vec<Record>,
    pub count: u64,
}

/// Produces independent per-shard bindings of a model
pub struct ModelBinder;

impl ModelBinder {
    /// Bind `model` to the connection of shard `shard`.
    ///
    /// Each call yields a fresh value owning its own connection handle.
    pub fn bind(
        model: Arc<ModelDeclaration>,
        shard: usize,
        backend: Arc<dyn ShardBackend>,
    ) -> ShardLocalModel {
        let table = TableRef {
            table: model.table.clone(),
            primary_key: model.primary_key.clone(),
        };
        ShardLocalModel {
            model,
            shard,
            backend,
            table,
        }
    }
}

/// A model bound to exactly one shard
#[derive(Clone)]
pub struct ShardLocalModel {
    model: Arc<ModelDeclaration>,
    shard: usize,
    backend: Arc<dyn ShardBackend>,
    table: TableRef,
}

impl fmt::Debug for ShardLocalModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardLocalModel")
            .field("model", &self.model.name)
            .field("shard", &self.shard)
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl ShardLocalModel {
    pub fn declaration(&self) -> &Arc<ModelDeclaration> {
        &self.model
    }

    /// Position of this shard in topology order
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Name of the connection this binding owns
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn backend(&self) -> &Arc<dyn ShardBackend> {
        &self.backend
    }

    fn wrap(&self, source: BackendError) -> ShardError {
        ShardError::Backend {
            shard: self.shard,
            source,
        }
    }

    async fn execute(&self, operation: Operation) -> Result<Outcome, ShardError> {
        let name = operation.name();
        trace!(model = %self.model.name, shard = self.shard, operation = name, "Shard call");
        metrics::record_shard_call(&self.model.name, self.shard);
        self.backend
            .execute(&self.table, operation)
            .await
            .map_err(|e| self.wrap(e))
    }

    pub async fn find_all(&self, filter: &Filter) -> Result<Vec<Record>, ShardError> {
        self.execute(Operation::Find(filter.clone()))
            .await?
            .into_rows("find")
            .map_err(|e| self.wrap(e))
    }

    pub async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, ShardError> {
        self.execute(Operation::FindOne(filter.clone()))
            .await?
            .into_row("find_one")
            .map_err(|e| self.wrap(e))
    }

    pub async fn find_by_pk(&self, pk: &serde_json::Value) -> Result<Option<Record>, ShardError> {
        self.find_one(&Filter::by(self.model.primary_key.clone(), pk.clone()))
            .await
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64, ShardError> {
        self.execute(Operation::Count(filter.clone()))
            .await?
            .into_count("count")
            .map_err(|e| self.wrap(e))
    }

    pub async fn find_and_count_all(&self, filter: &Filter) -> Result<FindAndCount, ShardError> {
        let (rows, count) = self
            .execute(Operation::FindAndCount(filter.clone()))
            .await?
            .into_rows_and_count("find_and_count")
            .map_err(|e| self.wrap(e))?;
        Ok(FindAndCount { rows, count })
    }

    pub async fn exists(&self, filter: &Filter) -> Result<bool, ShardError> {
        self.execute(Operation::Exists(filter.clone()))
            .await?
            .into_flag("exists")
            .map_err(|e| self.wrap(e))
    }

    /// Unsaved record bound to this shard
    pub fn build(&self, payload: Record) -> Draft {
        Draft {
            binding: self.clone(),
            values: payload,
            persisted: false,
            routed_by: None,
        }
    }

    pub async fn create(&self, payload: Record) -> Result<Record, ShardError> {
        let (record, _) = self
            .execute(Operation::Insert(payload))
            .await?
            .into_written("insert")
            .map_err(|e| self.wrap(e))?;
        Ok(record)
    }

    pub async fn bulk_create(&self, payloads: Vec<Record>) -> Result<Vec<Record>, ShardError> {
        self.execute(Operation::InsertMany(payloads))
            .await?
            .into_rows("insert_many")
            .map_err(|e| self.wrap(e))
    }

    /// Existing match as a persisted draft, or a new unsaved draft seeded
    /// from the filter's equalities and `defaults`. The flag is true when built.
    pub async fn find_or_build(
        &self,
        filter: &Filter,
        defaults: Record,
    ) -> Result<(Draft, bool), ShardError> {
        if let Some(found) = self.find_one(filter).await? {
            return Ok((
                Draft {
                    binding: self.clone(),
                    values: found,
                    persisted: true,
                    routed_by: None,
                },
                false,
            ));
        }
        let mut values = defaults;
        values.extend(filter.equality_values());
        Ok((self.build(values), true))
    }

    pub async fn find_or_create(
        &self,
        filter: &Filter,
        defaults: Record,
    ) -> Result<(Record, bool), ShardError> {
        self.execute(Operation::FindOrInsert {
            filter: filter.clone(),
            defaults,
        })
        .await?
        .into_written("find_or_insert")
        .map_err(|e| self.wrap(e))
    }

    /// Insert or update by primary key. The flag is true when inserted.
    pub async fn upsert(&self, payload: Record) -> Result<(Record, bool), ShardError> {
        self.execute(Operation::Upsert(payload))
            .await?
            .into_written("upsert")
            .map_err(|e| self.wrap(e))
    }

    pub async fn increment_by(
        &self,
        fields: &[&str],
        by: i64,
        filter: &Filter,
    ) -> Result<u64, ShardError> {
        self.execute(Operation::Increment {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            by,
            filter: filter.clone(),
        })
        .await?
        .into_count("increment")
        .map_err(|e| self.wrap(e))
    }

    pub async fn update(&self, values: Record, filter: &Filter) -> Result<u64, ShardError> {
        self.execute(Operation::Update {
            values,
            filter: filter.clone(),
        })
        .await?
        .into_count("update")
        .map_err(|e| self.wrap(e))
    }

    pub async fn destroy(&self, filter: &Filter) -> Result<u64, ShardError> {
        self.execute(Operation::Delete(filter.clone()))
            .await?
            .into_count("delete")
            .map_err(|e| self.wrap(e))
    }

    pub async fn truncate(&self) -> Result<(), ShardError> {
        self.execute(Operation::Truncate)
            .await?
            .into_done("truncate")
            .map_err(|e| self.wrap(e))
    }

    /// This shard's cursor over `filter`, `page_size` records buffered at a time
    pub fn iterate_all(&self, filter: Filter, page_size: usize) -> ShardStream {
        let shard = self.shard;
        Arc::clone(&self.backend)
            .scan(self.table.clone(), filter, page_size)
            .map(move |item| item.map_err(|source| ShardError::Backend { shard, source }))
            .boxed()
    }
}

/// A record built against one shard but not necessarily saved yet
#[derive(Debug, Clone)]
pub struct Draft {
    binding: ShardLocalModel,
    values: Record,
    persisted: bool,
    /// Key a router picked the shard by; `save` refuses once it no longer matches
    routed_by: Option<ShardKey>,
}

impl Draft {
    pub fn values(&self) -> &Record {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Record {
        &mut self.values
    }

    /// Shard this draft will be written to
    pub fn shard(&self) -> usize {
        self.binding.shard()
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Pin the draft to the key its shard was routed by
    pub(crate) fn routed_by(mut self, key: ShardKey) -> Self {
        self.routed_by = Some(key);
        self
    }

    /// Write the draft to its shard: insert when new, upsert when it came
    /// from an existing row.
    ///
    /// A draft handed out by a router facade fails with
    /// `DistributionKeyUpdate` if its distribution key was changed or
    /// removed since, as the row would land on the wrong shard.
    pub async fn save(&mut self) -> Result<Record, ShardError> {
        if let Some(expected) = &self.routed_by {
            let declaration = self.binding.declaration();
            let current = DistributionKeyResolver::new(declaration).value_from_payload(&self.values);
            if current.as_ref() != Some(expected) {
                let err = ShardError::DistributionKeyUpdate {
                    model: declaration.name.clone(),
                    key: declaration.distribution_key.clone(),
                };
                metrics::record_error(&declaration.name, err.error_type_label());
                return Err(err);
            }
        }
        let record = if self.persisted {
            self.binding.upsert(self.values.clone()).await?.0
        } else {
            self.binding.create(self.values.clone()).await?
        };
        self.values = record.clone();
        self.persisted = true;
        Ok(record)
    }

    pub fn into_values(self) -> Record {
        self.values
    }
}
