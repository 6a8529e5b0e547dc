//! Shard cluster
//!
//! Process-wide registry of shard connections and the router facades bound
//! over them. Created once at startup with `connect` and torn down with
//! `close`; there is no rebinding in between.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::local::ModelBinder;
use super::state::{ShardHealth, ShardState, ShardStatus};
use super::topology::ShardTopology;
use crate::backend::{Connector, ShardBackend};
use crate::config::{RouterConfig, ShardClusterConfig};
use crate::error::ShardError;
use crate::model::ModelRegistry;
use crate::router::Model;

/// Settings applied to every facade the cluster binds
#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub shard_timeout: Option<Duration>,
    pub page_size: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            shard_timeout: None,
            page_size: 500,
        }
    }
}

impl From<&RouterConfig> for RouterSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            shard_timeout: config.shard_timeout(),
            page_size: config.page_size,
        }
    }
}

/// Connections of one shard group, in topology order
struct ShardGroup {
    name: String,
    backends: Vec<Arc<dyn ShardBackend>>,
}

/// Connected shard groups plus the facades bound over them
pub struct ShardCluster {
    registry: ModelRegistry,
    groups: Vec<ShardGroup>,
    models: HashMap<String, Model>,
}

impl ShardCluster {
    /// Connect every configured shard and bind every registered model.
    ///
    /// Fails if any connection fails, if a group is empty, or if a model
    /// names a group that does not exist.
    pub async fn connect(
        groups: &[ShardClusterConfig],
        registry: ModelRegistry,
        settings: RouterSettings,
        connector: &dyn Connector,
    ) -> Result<Self, ShardError> {
        let mut connected = Vec::with_capacity(groups.len());

        for group in groups {
            info!(group = %group.name, shard_count = group.shards.len(), "Connecting shard group");

            let attempts = join_all(group.shards.iter().map(|shard| connector.connect(shard))).await;

            let mut backends = Vec::with_capacity(attempts.len());
            for (index, attempt) in attempts.into_iter().enumerate() {
                match attempt {
                    Ok(backend) => backends.push(backend),
                    Err(source) => {
                        error!(group = %group.name, shard = index, error = %source, "Shard connection failed");
                        for backend in &backends {
                            backend.close().await;
                        }
                        return Err(ShardError::Backend { shard: index, source });
                    }
                }
            }

            connected.push((group.name.clone(), backends));
        }

        Self::from_backends(connected, registry, settings)
    }

    /// Bind every registered model over already-open connections.
    ///
    /// Each group's vector order is its topology order.
    pub fn from_backends(
        groups: Vec<(String, Vec<Arc<dyn ShardBackend>>)>,
        registry: ModelRegistry,
        settings: RouterSettings,
    ) -> Result<Self, ShardError> {
        let groups: Vec<ShardGroup> = groups
            .into_iter()
            .map(|(name, backends)| ShardGroup { name, backends })
            .collect();

        let mut models = HashMap::new();
        for declaration in registry.declarations() {
            let group = groups
                .iter()
                .find(|g| g.name == declaration.shard_group)
                .ok_or_else(|| ShardError::UnknownShardGroup {
                    model: declaration.name.clone(),
                    group: declaration.shard_group.clone(),
                })?;

            let bindings = group
                .backends
                .iter()
                .enumerate()
                .map(|(index, backend)| {
                    ModelBinder::bind(Arc::clone(&declaration), index, Arc::clone(backend))
                })
                .collect();
            let topology = ShardTopology::new(&declaration.name, bindings)?;

            info!(
                model = %declaration.name,
                distribution_key = %declaration.distribution_key,
                shard_group = %group.name,
                shard_count = topology.len(),
                "Model bound"
            );

            let model = Model::facade(Arc::clone(&declaration), topology)
                .with_shard_timeout(settings.shard_timeout)
                .with_page_size(settings.page_size);
            models.insert(declaration.name.clone(), model);
        }

        Ok(Self {
            registry,
            groups,
            models,
        })
    }

    /// Router facade for a model
    pub fn model(&self, name: &str) -> Result<Model, ShardError> {
        match self.models.get(name) {
            Some(model) => Ok(model.clone()),
            None => {
                // Registered after the cluster was built: known but unbound.
                self.registry.get(name)?;
                Err(ShardError::ModelNotBound(name.to_string()))
            }
        }
    }

    /// Shard-local binding of a model on one shard
    pub fn shard_local(&self, name: &str, shard: usize) -> Result<Model, ShardError> {
        let facade = self.model(name)?;
        facade
            .topology()
            .and_then(|topology| topology.shard_at(shard))
            .map(|binding| Model::local(binding.clone()).with_page_size(facade.page_size()))
            .ok_or_else(|| ShardError::ModelNotBound(format!("{name}[{shard}]")))
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Names of bound models, sorted
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.models.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn shard_count(&self, group: &str) -> Option<usize> {
        self.groups
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.backends.len())
    }

    /// Ping every shard connection concurrently
    pub async fn health(&self) -> ShardState {
        let checks = self.groups.iter().flat_map(|group| {
            group.backends.iter().enumerate().map(move |(index, backend)| async move {
                let result = backend.ping().await;
                if let Err(ref e) = result {
                    warn!(group = %group.name, shard = index, error = %e, "Shard ping failed");
                }
                ShardStatus {
                    group: group.name.clone(),
                    shard: index,
                    name: backend.name().to_string(),
                    health: if result.is_ok() {
                        ShardHealth::Ready
                    } else {
                        ShardHealth::Unreachable
                    },
                    error: result.err().map(|e| e.to_string()),
                }
            })
        });

        ShardState {
            shards: join_all(checks).await,
        }
    }

    /// Close every connection
    pub async fn close(&self) {
        for group in &self.groups {
            join_all(group.backends.iter().map(|backend| backend.close())).await;
            info!(group = %group.name, "Shard group closed");
        }
    }
}
