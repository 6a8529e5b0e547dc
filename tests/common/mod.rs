//! Shared fixtures for router integration tests
//!
//! `ProbeBackend` wraps the in-memory backend and counts the calls each
//! shard receives, with optional injected failure and latency.

#![allow(dead_code)]

use arrakis_shard_router::backend::TableRef;
use arrakis_shard_router::{
    BackendError, MemoryBackend, Model, ModelBinder, ModelDeclaration, Operation, Outcome, Record,
    ShardBackend, ShardTopology,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct ProbeBackend {
    inner: MemoryBackend,
    calls: AtomicUsize,
    fail: Mutex<Option<BackendError>>,
    delay: Mutex<Option<Duration>>,
}

impl ProbeBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: MemoryBackend::new(name),
            calls: AtomicUsize::new(0),
            fail: Mutex::new(None),
            delay: Mutex::new(None),
        }
    }

    /// Calls received through the router since the last reset
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    pub fn fail_with(&self, error: BackendError) {
        *self.fail.lock().unwrap() = Some(error);
    }

    pub fn delay_by(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.inner.row_count(table)
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.inner.rows(table)
    }

    /// Insert directly, bypassing routing and the call counter
    pub async fn seed(&self, table: &TableRef, rows: Vec<Value>) {
        for row in rows {
            self.inner
                .execute(table, Operation::Insert(record(row)))
                .await
                .expect("seed insert");
        }
    }
}

#[async_trait]
impl ShardBackend for ProbeBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, table: &TableRef, operation: Operation) -> Result<Outcome, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fail = self.fail.lock().unwrap().clone();
        if let Some(error) = fail {
            return Err(error);
        }
        self.inner.execute(table, operation).await
    }
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("record must be a JSON object")
}

pub fn ids(rows: &[Record]) -> Vec<i64> {
    rows.iter().map(|r| r["id"].as_i64().unwrap()).collect()
}

pub fn table(decl: &ModelDeclaration) -> TableRef {
    TableRef {
        table: decl.table.clone(),
        primary_key: decl.primary_key.clone(),
    }
}

/// A facade over `n` probe shards plus the probes themselves, in topology order
pub fn facade(decl: ModelDeclaration, n: usize) -> (Model, Vec<Arc<ProbeBackend>>) {
    let decl = Arc::new(decl);
    let probes: Vec<Arc<ProbeBackend>> = (0..n)
        .map(|i| Arc::new(ProbeBackend::new(format!("{}-{i}", decl.shard_group))))
        .collect();
    let bindings = probes
        .iter()
        .enumerate()
        .map(|(i, probe)| {
            ModelBinder::bind(Arc::clone(&decl), i, Arc::clone(probe) as Arc<dyn ShardBackend>)
        })
        .collect();
    let topology = ShardTopology::new(&decl.name, bindings).expect("non-empty topology");
    (Model::facade(decl, topology), probes)
}

/// `character`: sharded by its primary key `id`
pub fn character() -> ModelDeclaration {
    ModelDeclaration::new("character", "player")
}

/// `inventory`: primary key `id`, sharded by `player_id`
pub fn inventory() -> ModelDeclaration {
    ModelDeclaration::new("inventory", "player").distribution_key("player_id")
}

pub fn total_calls(probes: &[Arc<ProbeBackend>]) -> Vec<usize> {
    probes.iter().map(|p| p.calls()).collect()
}

pub fn reset(probes: &[Arc<ProbeBackend>]) {
    for probe in probes {
        probe.reset_calls();
    }
}
