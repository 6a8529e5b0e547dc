//! Router configuration module
//!
//! Loads the shard cluster layout and model sharding declarations from an
//! optional TOML file layered under `SHARD_ROUTER__*` environment variables.
//! A `.env` file is honoured for local development.

use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::error::ShardError;
use crate::model::{ModelDeclaration, ModelRegistry, DEFAULT_PRIMARY_KEY};

/// Default config file path when `SHARD_ROUTER_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "shard-router.toml";

/// Environment prefix for overrides, e.g. `SHARD_ROUTER__HTTP_PORT=9191`
pub const ENV_PREFIX: &str = "SHARD_ROUTER";

/// One physical shard connection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    /// Connection name, unique within its group
    pub name: String,
    /// Driver URL, e.g. `memory://player-0`
    pub url: String,
}

/// Ordered shard connections of one shard group.
/// Order is topology order and must not change once data is written.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShardClusterConfig {
    pub name: String,
    pub shards: Vec<ConnectionConfig>,
}

/// How one model is sharded
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelShardingDeclaration {
    pub name: String,
    /// Defaults to the primary key
    #[serde(default)]
    pub distribution_key: Option<String>,
    /// Defaults to "id"
    #[serde(default)]
    pub primary_key: Option<String>,
    pub shard_group: String,
    /// Defaults to the model name
    #[serde(default)]
    pub table: Option<String>,
}

impl ModelShardingDeclaration {
    pub fn to_declaration(&self) -> ModelDeclaration {
        let primary_key = self
            .primary_key
            .clone()
            .unwrap_or_else(|| DEFAULT_PRIMARY_KEY.to_string());
        let mut decl = ModelDeclaration::new(self.name.clone(), self.shard_group.clone())
            .primary_key(primary_key);
        if let Some(ref key) = self.distribution_key {
            decl = decl.distribution_key(key.clone());
        }
        if let Some(ref table) = self.table {
            decl = decl.table(table.clone());
        }
        decl
    }
}

/// Router configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Health/metrics HTTP port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Per-shard-call deadline in milliseconds; unset means no deadline
    #[serde(default)]
    pub shard_timeout_ms: Option<u64>,

    /// Records buffered per page when iterating shards
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Shard groups, each an ordered list of connections
    #[serde(default)]
    pub groups: Vec<ShardClusterConfig>,

    /// Sharded model declarations
    #[serde(default)]
    pub models: Vec<ModelShardingDeclaration>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_port() -> u16 {
    9090
}

fn default_page_size() -> usize {
    500
}

impl RouterConfig {
    /// Load configuration from `SHARD_ROUTER_CONFIG` (or the default path)
    /// plus environment overrides
    pub fn from_env() -> Result<Self, ShardError> {
        dotenvy::dotenv().ok();

        let path = std::env::var("SHARD_ROUTER_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(&path)
    }

    /// Load configuration from a TOML file (optional) plus environment overrides
    pub fn load(path: &str) -> Result<Self, ShardError> {
        let built = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| ShardError::Config(e.to_string()))?;
        Self::finish(built)
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml_str(text: &str) -> Result<Self, ShardError> {
        let built = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .map_err(|e| ShardError::Config(e.to_string()))?;
        Self::finish(built)
    }

    fn finish(built: config::Config) -> Result<Self, ShardError> {
        let parsed: Self = built
            .try_deserialize()
            .map_err(|e| ShardError::Config(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Reject layouts the router cannot serve
    pub fn validate(&self) -> Result<(), ShardError> {
        if self.page_size == 0 {
            return Err(ShardError::Config("page_size must be at least 1".to_string()));
        }

        let mut groups = HashSet::new();
        for group in &self.groups {
            if !groups.insert(group.name.as_str()) {
                return Err(ShardError::Config(format!(
                    "shard group {} declared twice",
                    group.name
                )));
            }
            let mut names = HashSet::new();
            for shard in &group.shards {
                if !names.insert(shard.name.as_str()) {
                    return Err(ShardError::Config(format!(
                        "shard {} appears twice in group {}",
                        shard.name, group.name
                    )));
                }
            }
        }

        let mut models = HashSet::new();
        for model in &self.models {
            if !models.insert(model.name.as_str()) {
                return Err(ShardError::Config(format!("model {} declared twice", model.name)));
            }
            let Some(group) = self.groups.iter().find(|g| g.name == model.shard_group) else {
                return Err(ShardError::UnknownShardGroup {
                    model: model.name.clone(),
                    group: model.shard_group.clone(),
                });
            };
            if group.shards.is_empty() {
                return Err(ShardError::EmptyTopology {
                    model: model.name.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn shard_timeout(&self) -> Option<Duration> {
        self.shard_timeout_ms.map(Duration::from_millis)
    }

    /// Registration table populated from the declared models
    pub fn registry(&self) -> Result<ModelRegistry, ShardError> {
        let registry = ModelRegistry::new();
        for model in &self.models {
            registry.register(model.to_declaration())?;
        }
        Ok(registry)
    }
}
