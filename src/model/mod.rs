//! Model metadata
//!
//! Records, filters and the explicit registration table that tells the
//! router how each model is sharded.

mod filter;
mod registry;

pub use filter::{Condition, Direction, Filter, Order};
pub use registry::ModelRegistry;

pub(crate) use filter::compare_values;

use serde::{Deserialize, Serialize};

/// A record payload: attribute name to value
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Primary key attribute used when a declaration omits one
pub const DEFAULT_PRIMARY_KEY: &str = "id";

/// How one model type is sharded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDeclaration {
    /// Model name, also the default table name
    pub name: String,
    /// Attribute whose value picks the shard
    pub distribution_key: String,
    /// Primary key attribute
    pub primary_key: String,
    /// Shard group (cluster) whose connections hold this model's rows
    pub shard_group: String,
    /// Table name on each shard
    pub table: String,
}

impl ModelDeclaration {
    /// Declare a model keyed and sharded by the default primary key
    pub fn new(name: impl Into<String>, shard_group: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            distribution_key: DEFAULT_PRIMARY_KEY.to_string(),
            primary_key: DEFAULT_PRIMARY_KEY.to_string(),
            shard_group: shard_group.into(),
        }
    }

    pub fn distribution_key(mut self, key: impl Into<String>) -> Self {
        self.distribution_key = key.into();
        self
    }

    /// Set the primary key. The distribution key follows it unless it was
    /// already set to something else.
    pub fn primary_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if self.distribution_key == self.primary_key {
            self.distribution_key = key.clone();
        }
        self.primary_key = key;
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Whether primary key lookups can be routed to a single shard
    pub fn sharded_by_primary_key(&self) -> bool {
        self.distribution_key == self.primary_key
    }
}
