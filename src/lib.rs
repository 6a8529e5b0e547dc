//! Arrakis Shard Router - shard-aware data access for game backends
//!
//! Sits between application code and a cluster of structurally identical
//! databases ("shards"). Models declared as sharded by a distribution key
//! keep the ordinary record vocabulary (find, create, count, increment...)
//! while the router decides per call whether it goes to one shard or runs
//! on all of them and gets merged.
//!
//! ```no_run
//! # async fn demo() -> Result<(), arrakis_shard_router::ShardError> {
//! use arrakis_shard_router::{
//!     MemoryConnector, ModelDeclaration, ModelRegistry, RouterSettings, ShardCluster,
//! };
//! use arrakis_shard_router::config::{ConnectionConfig, ShardClusterConfig};
//!
//! let registry = ModelRegistry::new();
//! registry.register(ModelDeclaration::new("inventory", "player").distribution_key("player_id"))?;
//!
//! let group = ShardClusterConfig {
//!     name: "player".to_string(),
//!     shards: vec![ConnectionConfig { name: "p0".into(), url: "memory://p0".into() }],
//! };
//! let cluster =
//!     ShardCluster::connect(&[group], registry, RouterSettings::default(), &MemoryConnector).await?;
//! let inventory = cluster.model("inventory")?;
//! let total = inventory.count(&Default::default()).await?;
//! # let _ = total;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod router;
pub mod shard;

pub use backend::{Connector, MemoryBackend, MemoryConnector, Operation, Outcome, ShardBackend};
pub use error::{BackendError, KeySource, ShardError};
pub use model::{Condition, Direction, Filter, ModelDeclaration, ModelRegistry, Record};
pub use router::{Model, RouteDecision, ShardStream};
pub use shard::{
    DistributionKeyResolver, Draft, FindAndCount, ModelBinder, RouterSettings, ShardCluster,
    ShardKey, ShardLocalModel, ShardTopology,
};
