//! Shard health snapshots
//!
//! Produced on demand by pinging every connection; nothing here is kept
//! between calls.

use serde::Serialize;

/// Health status for a shard connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardHealth {
    /// Connection answered a ping
    Ready,
    /// Ping failed
    Unreachable,
}

impl ShardHealth {
    pub fn is_ready(&self) -> bool {
        matches!(self, ShardHealth::Ready)
    }
}

/// Health of one shard in one group
#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub group: String,
    pub shard: usize,
    pub name: String,
    pub health: ShardHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health of every shard in the cluster, in group then topology order
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShardState {
    pub shards: Vec<ShardStatus>,
}

impl ShardState {
    /// Get count of ready shards
    pub fn ready_shards(&self) -> usize {
        self.shards.iter().filter(|s| s.health.is_ready()).count()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Every shard must answer: a fan-out needs all of them
    pub fn is_ready(&self) -> bool {
        !self.shards.is_empty() && self.ready_shards() == self.shard_count()
    }
}
