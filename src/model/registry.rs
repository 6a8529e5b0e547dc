//! Model registration table
//!
//! Populated by explicit calls at startup (from configuration or code),
//! never by scanning types. Lookups after startup are read-only.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::ModelDeclaration;
use crate::error::ShardError;

/// Registry of model declarations keyed by model name
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Arc<DashMap<String, Arc<ModelDeclaration>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model. Registering the same name twice is a configuration error.
    pub fn register(&self, declaration: ModelDeclaration) -> Result<Arc<ModelDeclaration>, ShardError> {
        if declaration.distribution_key.is_empty() {
            return Err(ShardError::Config(format!(
                "model {} has an empty distribution key",
                declaration.name
            )));
        }

        let name = declaration.name.clone();
        let declaration = Arc::new(declaration);

        match self.models.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ShardError::Config(format!(
                "model {name} registered twice"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(
                    model = %name,
                    distribution_key = %declaration.distribution_key,
                    shard_group = %declaration.shard_group,
                    "Model registered"
                );
                slot.insert(Arc::clone(&declaration));
                Ok(declaration)
            }
        }
    }

    /// Look up a model's declaration
    pub fn get(&self, name: &str) -> Result<Arc<ModelDeclaration>, ShardError> {
        self.models
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ShardError::UnknownModel(name.to_string()))
    }

    /// Name of the distribution key attribute for a model
    pub fn key_of(&self, name: &str) -> Result<String, ShardError> {
        self.get(name).map(|decl| decl.distribution_key.clone())
    }

    /// Every declaration, sorted by model name
    pub fn declarations(&self) -> Vec<Arc<ModelDeclaration>> {
        let mut all: Vec<_> = self.models.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
