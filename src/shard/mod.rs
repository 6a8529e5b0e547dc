//! Shard management module
//!
//! Distribution key resolution, per-shard model bindings, the topology
//! that maps keys to shards, and the cluster that owns every connection.

mod cluster;
mod key;
mod local;
mod state;
mod topology;

pub use cluster::{RouterSettings, ShardCluster};
pub use key::{DistributionKeyResolver, ShardKey};
pub use local::{Draft, FindAndCount, ModelBinder, ShardLocalModel};
pub use state::{ShardHealth, ShardState, ShardStatus};
pub use topology::ShardTopology;
