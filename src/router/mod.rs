//! Query routing
//!
//! `Model` is the surface application code calls, whether the model is a
//! router facade spanning every shard or a shard-local binding. For a
//! facade each call is routed: a call that pins the distribution key goes
//! to exactly one shard verbatim, any other call runs on every shard
//! concurrently and the results are merged per operation shape. Mutations
//! that need a single shard fail when no key value can be resolved.
//!
//! Fan-out is not globally ordered or paginated: LIMIT/OFFSET/ORDER BY are
//! applied by each shard and the merged list is in topology order.

mod aggregate;
mod iter;

pub use aggregate::{Merge, ResultShape};
pub use iter::{LazyShardIterator, ShardStream};

use futures::future::try_join_all;
use futures::StreamExt;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};
use uuid::Uuid;

use crate::error::ShardError;
use crate::metrics;
use crate::model::{Filter, ModelDeclaration, Record};
use crate::shard::{
    DistributionKeyResolver, Draft, FindAndCount, ShardKey, ShardLocalModel, ShardTopology,
};

/// Where one call goes. Computed once per call and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Facade call pinned to one shard
    SingleShard(usize),
    /// Facade call that must run on every shard
    FanOutAll,
    /// Call on a shard-local binding: no routing
    AlreadyLocal,
}

impl RouteDecision {
    fn label(&self) -> &'static str {
        match self {
            RouteDecision::SingleShard(_) => "single_shard",
            RouteDecision::FanOutAll => "fan_out",
            RouteDecision::AlreadyLocal => "local",
        }
    }
}

#[derive(Debug, Clone)]
enum Binding {
    Facade(ShardTopology),
    Local(ShardLocalModel),
}

/// Bindings one call runs on
enum Target<'a> {
    One(&'a ShardLocalModel),
    All(&'a [ShardLocalModel]),
}

/// A sharded model, as a router facade or as a shard-local binding
#[derive(Debug, Clone)]
pub struct Model {
    declaration: Arc<ModelDeclaration>,
    binding: Binding,
    cancel: CancellationToken,
    shard_timeout: Option<Duration>,
    page_size: usize,
}

impl Model {
    /// Router facade spanning every shard of `topology`
    pub fn facade(declaration: Arc<ModelDeclaration>, topology: ShardTopology) -> Self {
        Self {
            declaration,
            binding: Binding::Facade(topology),
            cancel: CancellationToken::new(),
            shard_timeout: None,
            page_size: 500,
        }
    }

    /// Shard-local binding: every call goes straight to its shard
    pub fn local(binding: ShardLocalModel) -> Self {
        Self {
            declaration: Arc::clone(binding.declaration()),
            binding: Binding::Local(binding),
            cancel: CancellationToken::new(),
            shard_timeout: None,
            page_size: 500,
        }
    }

    /// Same model whose shard calls abort when `token` is cancelled
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..self.clone()
        }
    }

    /// Deadline for each individual shard call
    pub fn with_shard_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shard_timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.declaration.name
    }

    pub fn declaration(&self) -> &Arc<ModelDeclaration> {
        &self.declaration
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// True for a facade spanning one or more shards
    pub fn is_facade(&self) -> bool {
        match &self.binding {
            Binding::Facade(topology) => topology.is_facade(),
            Binding::Local(_) => false,
        }
    }

    pub fn topology(&self) -> Option<&ShardTopology> {
        match &self.binding {
            Binding::Facade(topology) => Some(topology),
            Binding::Local(_) => None,
        }
    }

    /// Shards this model spans (1 for a shard-local binding)
    pub fn shard_count(&self) -> usize {
        match &self.binding {
            Binding::Facade(topology) => topology.len(),
            Binding::Local(_) => 1,
        }
    }

    /// Shard index a key maps to, for a facade
    pub fn shard_index(&self, key: &ShardKey) -> Result<usize, ShardError> {
        match &self.binding {
            Binding::Facade(topology) => Ok(topology.shard_index(key)),
            Binding::Local(_) => Err(ShardError::EmptyTopology {
                model: self.declaration.name.clone(),
            }),
        }
    }

    fn resolver(&self) -> DistributionKeyResolver<'_> {
        DistributionKeyResolver::new(&self.declaration)
    }

    /// Where a read with `filter` would go, without issuing or recording it
    pub fn route_filter(&self, filter: &Filter) -> RouteDecision {
        match &self.binding {
            Binding::Local(_) => RouteDecision::AlreadyLocal,
            Binding::Facade(topology) => match self.resolver().value_from_filter(filter) {
                Some(key) => RouteDecision::SingleShard(topology.shard_index(&key)),
                None => RouteDecision::FanOutAll,
            },
        }
    }

    fn record_route(&self, operation: &'static str, target: &Target<'_>) {
        let decision = match (&self.binding, target) {
            (Binding::Local(_), _) => RouteDecision::AlreadyLocal,
            (Binding::Facade(_), Target::One(shard)) => RouteDecision::SingleShard(shard.shard()),
            (Binding::Facade(_), Target::All(_)) => RouteDecision::FanOutAll,
        };
        debug!(model = %self.declaration.name, operation, route = ?decision, "Route decided");
        metrics::record_route(&self.declaration.name, operation, decision.label());
    }

    /// Route by an optional key: one shard when known, else every shard
    fn route(&self, operation: &'static str, key: Option<ShardKey>) -> Target<'_> {
        let target = match (&self.binding, key) {
            (Binding::Local(local), _) => Target::One(local),
            (Binding::Facade(topology), Some(key)) => Target::One(topology.shard_for(&key)),
            (Binding::Facade(topology), None) => Target::All(topology.all()),
        };
        self.record_route(operation, &target);
        target
    }

    /// Route a read: single shard when the filter pins the key, else fan-out
    fn route_read(&self, operation: &'static str, filter: &Filter) -> Target<'_> {
        let key = match self.binding {
            Binding::Facade(_) => self.resolver().value_from_filter(filter),
            Binding::Local(_) => None,
        };
        self.route(operation, key)
    }

    /// Route a call that must reach exactly one shard. A facade needs the
    /// key; the key it routed by is returned alongside the binding.
    fn route_required<F>(
        &self,
        operation: &'static str,
        resolve: F,
    ) -> Result<(&ShardLocalModel, Option<ShardKey>), ShardError>
    where
        F: FnOnce(&DistributionKeyResolver<'_>) -> Result<ShardKey, ShardError>,
    {
        let (shard, key) = match &self.binding {
            Binding::Local(local) => (local, None),
            Binding::Facade(topology) => match resolve(&self.resolver()) {
                Ok(key) => (topology.shard_for(&key), Some(key)),
                Err(e) => {
                    metrics::record_error(&self.declaration.name, e.error_type_label());
                    return Err(e);
                }
            },
        };
        self.record_route(operation, &Target::One(shard));
        Ok((shard, key))
    }

    /// Route a mutation by the key in its filter; no key is an error
    fn route_by_filter(
        &self,
        operation: &'static str,
        filter: &Filter,
    ) -> Result<(&ShardLocalModel, Option<ShardKey>), ShardError> {
        self.route_required(operation, |resolver| resolver.require_from_filter(filter))
    }

    /// Route a mutation by the key in its payload; no key is an error
    fn route_by_payload(
        &self,
        operation: &'static str,
        payload: &Record,
    ) -> Result<(&ShardLocalModel, Option<ShardKey>), ShardError> {
        self.route_required(operation, |resolver| resolver.require_from_payload(payload))
    }

    /// Run one shard call under the cancellation token and per-shard deadline
    async fn guarded<T, Fut>(&self, shard: usize, call: Fut) -> Result<T, ShardError>
    where
        Fut: Future<Output = Result<T, ShardError>>,
    {
        let bounded = async {
            match self.shard_timeout {
                Some(timeout) => tokio::time::timeout(timeout, call)
                    .await
                    .map_err(|_| ShardError::Timeout { shard, timeout })?,
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ShardError::Cancelled { shard }),
            result = bounded => result,
        }
    }

    /// Single-target call, errors passed through unchanged
    async fn single<T, F, Fut>(&self, target: &ShardLocalModel, call: F) -> Result<T, ShardError>
    where
        F: FnOnce(ShardLocalModel) -> Fut,
        Fut: Future<Output = Result<T, ShardError>>,
    {
        let result = self.guarded(target.shard(), call(target.clone())).await;
        if let Err(ref e) = result {
            metrics::record_error(&self.declaration.name, e.error_type_label());
        }
        result
    }

    fn aggregate_failure(&self, operation: &'static str, shard: usize, source: ShardError) -> ShardError {
        let err = ShardError::AggregateFailure {
            model: self.declaration.name.clone(),
            operation,
            shard,
            source: Box::new(source),
        };
        metrics::record_error(&self.declaration.name, err.error_type_label());
        err
    }

    /// Run `call` on every shard concurrently and merge in topology order.
    ///
    /// The first failure fails the whole call; outstanding shard calls are
    /// dropped and partial results discarded.
    async fn fan_out<T, F, Fut>(
        &self,
        operation: &'static str,
        shards: &[ShardLocalModel],
        call: F,
    ) -> Result<T, ShardError>
    where
        T: Merge,
        F: Fn(ShardLocalModel) -> Fut,
        Fut: Future<Output = Result<T, ShardError>>,
    {
        let call_id = Uuid::new_v4();
        let span = debug_span!(
            "fan_out",
            %call_id,
            model = %self.declaration.name,
            operation,
            shape = T::SHAPE.label(),
            shard_count = shards.len()
        );

        let start = Instant::now();
        let calls = shards.iter().map(|shard| {
            let index = shard.shard();
            let fut = call(shard.clone());
            async move { self.guarded(index, fut).await.map_err(|e| (index, e)) }
        });

        let result = try_join_all(calls).instrument(span).await;
        metrics::record_fan_out_duration(&self.declaration.name, operation, start.elapsed());

        match result {
            Ok(parts) => Ok(T::merge(parts)),
            Err((shard, source)) => {
                warn!(
                    %call_id,
                    model = %self.declaration.name,
                    operation,
                    shard,
                    error = %source,
                    "Fan-out failed"
                );
                Err(self.aggregate_failure(operation, shard, source))
            }
        }
    }

    /// Scan shards one at a time in topology order, stopping at the first hit
    async fn first_match<F, Fut>(
        &self,
        operation: &'static str,
        shards: &[ShardLocalModel],
        call: F,
    ) -> Result<Option<Record>, ShardError>
    where
        F: Fn(ShardLocalModel) -> Fut,
        Fut: Future<Output = Result<Option<Record>, ShardError>>,
    {
        for shard in shards {
            let index = shard.shard();
            match self.guarded(index, call(shard.clone())).await {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => continue,
                Err(source) => return Err(self.aggregate_failure(operation, index, source)),
            }
        }
        Ok(None)
    }

    pub async fn find_all(&self, filter: &Filter) -> Result<Vec<Record>, ShardError> {
        match self.route_read("find_all", filter) {
            Target::All(shards) => {
                self.fan_out("find_all", shards, |shard| async move {
                    shard.find_all(filter).await
                })
                .await
            }
            Target::One(shard) => {
                self.single(shard, |shard| async move { shard.find_all(filter).await })
                    .await
            }
        }
    }

    /// First match; a fan-out scans shards sequentially in topology order
    pub async fn find_one(&self, filter: &Filter) -> Result<Option<Record>, ShardError> {
        match self.route_read("find_one", filter) {
            Target::All(shards) => {
                self.first_match("find_one", shards, |shard| async move {
                    shard.find_one(filter).await
                })
                .await
            }
            Target::One(shard) => {
                self.single(shard, |shard| async move { shard.find_one(filter).await })
                    .await
            }
        }
    }

    /// Lookup by primary key. Routed when the model is sharded by its
    /// primary key, otherwise a sequential first-match scan.
    pub async fn find_by_pk(&self, pk: impl Into<Value>) -> Result<Option<Record>, ShardError> {
        let pk = pk.into();
        if self.declaration.sharded_by_primary_key() {
            let filter = Filter::by(self.declaration.primary_key.clone(), pk);
            return self.find_one(&filter).await;
        }
        let pk = &pk;
        match self.route("find_by_pk", None) {
            Target::All(shards) => {
                self.first_match("find_by_pk", shards, |shard| async move {
                    shard.find_by_pk(pk).await
                })
                .await
            }
            Target::One(shard) => {
                self.single(shard, |shard| async move { shard.find_by_pk(pk).await })
                    .await
            }
        }
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64, ShardError> {
        match self.route_read("count", filter) {
            Target::All(shards) => {
                self.fan_out("count", shards, |shard| async move { shard.count(filter).await })
                    .await
            }
            Target::One(shard) => {
                self.single(shard, |shard| async move { shard.count(filter).await })
                    .await
            }
        }
    }

    /// Rows plus total count. Under fan-out each shard applies the window
    /// locally, so rows can exceed the limit; see `Merge for FindAndCount`.
    pub async fn find_and_count_all(&self, filter: &Filter) -> Result<FindAndCount, ShardError> {
        match self.route_read("find_and_count_all", filter) {
            Target::All(shards) => {
                self.fan_out("find_and_count_all", shards, |shard| async move {
                    shard.find_and_count_all(filter).await
                })
                .await
            }
            Target::One(shard) => {
                self.single(shard, |shard| async move {
                    shard.find_and_count_all(filter).await
                })
                .await
            }
        }
    }

    pub async fn exists(&self, filter: &Filter) -> Result<bool, ShardError> {
        match self.route_read("exists", filter) {
            Target::All(shards) => {
                self.fan_out("exists", shards, |shard| async move { shard.exists(filter).await })
                    .await
            }
            Target::One(shard) => {
                self.single(shard, |shard| async move { shard.exists(filter).await })
                    .await
            }
        }
    }

    /// Unsaved record bound to the shard its payload's key maps to.
    ///
    /// From a facade the draft remembers that key, and `Draft::save`
    /// refuses it once the key is edited.
    pub fn build(&self, payload: Record) -> Result<Draft, ShardError> {
        let (shard, key) = self.route_by_payload("build", &payload)?;
        let draft = shard.build(payload);
        Ok(match key {
            Some(key) => draft.routed_by(key),
            None => draft,
        })
    }

    pub async fn create(&self, payload: Record) -> Result<Record, ShardError> {
        let (shard, _) = self.route_by_payload("create", &payload)?;
        self.single(shard, |shard| async move { shard.create(payload).await })
            .await
    }

    /// Create many records. Every payload must carry its key; payloads are
    /// grouped per shard and each group is written with one concurrent call.
    /// Results come back in input order.
    pub async fn bulk_create(&self, payloads: Vec<Record>) -> Result<Vec<Record>, ShardError> {
        let topology = match &self.binding {
            Binding::Local(local) => {
                self.record_route("bulk_create", &Target::One(local));
                return self
                    .single(local, |shard| async move { shard.bulk_create(payloads).await })
                    .await;
            }
            Binding::Facade(topology) => topology,
        };

        let resolver = self.resolver();
        let mut groups: Vec<Vec<(usize, Record)>> = vec![Vec::new(); topology.len()];
        for (position, payload) in payloads.into_iter().enumerate() {
            let key = match resolver.require_from_payload(&payload) {
                Ok(key) => key,
                Err(e) => {
                    metrics::record_error(&self.declaration.name, e.error_type_label());
                    return Err(e);
                }
            };
            groups[topology.shard_index(&key)].push((position, payload));
        }
        let total: usize = groups.iter().map(Vec::len).sum();
        metrics::record_route(&self.declaration.name, "bulk_create", "grouped");

        let calls = topology
            .all()
            .iter()
            .zip(groups)
            .filter(|(_, group)| !group.is_empty())
            .map(|(shard, group)| {
                let index = shard.shard();
                let shard = shard.clone();
                let (positions, records): (Vec<usize>, Vec<Record>) = group.into_iter().unzip();
                async move {
                    let created = self
                        .guarded(index, async move { shard.bulk_create(records).await })
                        .await
                        .map_err(|e| (index, e))?;
                    Ok::<_, (usize, ShardError)>(positions.into_iter().zip(created).collect::<Vec<_>>())
                }
            });

        let written = try_join_all(calls)
            .await
            .map_err(|(shard, source)| self.aggregate_failure("bulk_create", shard, source))?;

        let mut ordered: Vec<Option<Record>> = vec![None; total];
        for (position, record) in written.into_iter().flatten() {
            ordered[position] = Some(record);
        }
        Ok(ordered.into_iter().flatten().collect())
    }

    /// Find a match on the shard the filter's key maps to, or build a draft there
    pub async fn find_or_build(
        &self,
        filter: &Filter,
        defaults: Record,
    ) -> Result<(Draft, bool), ShardError> {
        let (shard, key) = self.route_by_filter("find_or_build", filter)?;
        let (draft, built) = self
            .single(shard, |shard| async move {
                shard.find_or_build(filter, defaults).await
            })
            .await?;
        let draft = match key {
            Some(key) => draft.routed_by(key),
            None => draft,
        };
        Ok((draft, built))
    }

    pub async fn find_or_create(
        &self,
        filter: &Filter,
        defaults: Record,
    ) -> Result<(Record, bool), ShardError> {
        let (shard, _) = self.route_by_filter("find_or_create", filter)?;
        self.single(shard, |shard| async move {
            shard.find_or_create(filter, defaults).await
        })
        .await
    }

    pub async fn upsert(&self, payload: Record) -> Result<(Record, bool), ShardError> {
        let (shard, _) = self.route_by_payload("upsert", &payload)?;
        self.single(shard, |shard| async move { shard.upsert(payload).await })
            .await
    }

    /// Add 1 to each of `fields` on rows matching `filter`
    pub async fn increment(&self, fields: &[&str], filter: &Filter) -> Result<u64, ShardError> {
        self.increment_by(fields, 1, filter).await
    }

    pub async fn increment_by(
        &self,
        fields: &[&str],
        by: i64,
        filter: &Filter,
    ) -> Result<u64, ShardError> {
        let (shard, _) = self.route_by_filter("increment", filter)?;
        self.single(shard, |shard| async move {
            shard.increment_by(fields, by, filter).await
        })
        .await
    }

    pub async fn decrement(&self, fields: &[&str], filter: &Filter) -> Result<u64, ShardError> {
        self.increment_by(fields, -1, filter).await
    }

    /// Update matching rows. Rewriting the distribution key would strand
    /// rows on the wrong shard, so it is refused.
    pub async fn update(&self, values: Record, filter: &Filter) -> Result<u64, ShardError> {
        if self.is_facade() && values.contains_key(&self.declaration.distribution_key) {
            let err = ShardError::DistributionKeyUpdate {
                model: self.declaration.name.clone(),
                key: self.declaration.distribution_key.clone(),
            };
            metrics::record_error(&self.declaration.name, err.error_type_label());
            return Err(err);
        }

        match self.route_read("update", filter) {
            Target::All(shards) => {
                let values = &values;
                self.fan_out("update", shards, |shard| async move {
                    shard.update(values.clone(), filter).await
                })
                .await
            }
            Target::One(shard) => {
                self.single(shard, |shard| async move { shard.update(values, filter).await })
                    .await
            }
        }
    }

    pub async fn destroy(&self, filter: &Filter) -> Result<u64, ShardError> {
        match self.route_read("destroy", filter) {
            Target::All(shards) => {
                self.fan_out("destroy", shards, |shard| async move {
                    shard.destroy(filter).await
                })
                .await
            }
            Target::One(shard) => {
                self.single(shard, |shard| async move { shard.destroy(filter).await })
                    .await
            }
        }
    }

    /// Empty the table on every shard
    pub async fn truncate(&self) -> Result<(), ShardError> {
        match self.route("truncate", None) {
            Target::All(shards) => {
                self.fan_out("truncate", shards, |shard| async move { shard.truncate().await })
                    .await
            }
            Target::One(shard) => {
                self.single(shard, |shard| async move { shard.truncate().await })
                    .await
            }
        }
    }

    /// Lazily stream matching records. A key-pinning filter reads one shard;
    /// otherwise shards are drained one after another in topology order.
    pub fn iterate_all(&self, filter: Filter) -> ShardStream {
        let shards = match self.route_read("iterate_all", &filter) {
            Target::All(shards) => shards.to_vec(),
            Target::One(shard) => vec![shard.clone()],
        };
        LazyShardIterator::new(shards, self.page_size).stream(filter, self.cancel.clone())
    }

    /// Collect `iterate_all` into memory
    pub async fn collect_all(&self, filter: Filter) -> Result<Vec<Record>, ShardError> {
        let mut stream = self.iterate_all(filter);
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}
