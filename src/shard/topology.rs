//! Shard topology
//!
//! The ordered, fixed list of shard-local bindings for one model. The order
//! is the configuration order and defines merge and short-circuit order.
//! Shard count never changes for the lifetime of a topology; adding or
//! removing shards remaps keys and is not handled here.

use std::sync::Arc;

use super::key::ShardKey;
use super::local::ShardLocalModel;
use crate::error::ShardError;

/// Immutable list of shard-local bindings in topology order
#[derive(Debug, Clone)]
pub struct ShardTopology {
    shards: Arc<[ShardLocalModel]>,
}

impl ShardTopology {
    /// Build a topology. An empty shard list is rejected here, not on first use.
    pub fn new(model: &str, shards: Vec<ShardLocalModel>) -> Result<Self, ShardError> {
        if shards.is_empty() {
            return Err(ShardError::EmptyTopology {
                model: model.to_string(),
            });
        }
        Ok(Self {
            shards: shards.into(),
        })
    }

    /// Number of shards (N)
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// A topology spanning one or more shards routes as a facade
    pub fn is_facade(&self) -> bool {
        !self.shards.is_empty()
    }

    /// `hash(key) mod N`
    pub fn shard_index(&self, key: &ShardKey) -> usize {
        // Construction guarantees N > 0.
        key.index_for(self.shards.len()).unwrap_or(0)
    }

    pub fn shard_at(&self, index: usize) -> Option<&ShardLocalModel> {
        self.shards.get(index)
    }

    /// Binding that owns `key`
    pub fn shard_for(&self, key: &ShardKey) -> &ShardLocalModel {
        &self.shards[self.shard_index(key)]
    }

    /// Every binding in topology order
    pub fn all(&self) -> &[ShardLocalModel] {
        &self.shards
    }
}
