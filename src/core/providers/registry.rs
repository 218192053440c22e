use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use super::{adapter_for, ProviderAdapter, ProviderConfig};
use crate::core::error::{Error, Result};

#[derive(Default)]
struct RegistryState {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    /// Insertion order, for listing and for picking a new default.
    order: Vec<String>,
    default_id: Option<String>,
}

/// Provider configurations by id, each with its ready-to-use adapter.
///
/// The first config added becomes the default until another is chosen.
/// Lookups hand out `Arc`s, so a generation keeps its adapter even if the
/// config is replaced or removed while it runs.
pub struct ProviderRegistry {
    client: reqwest::Client,
    state: RwLock<RegistryState>,
}

impl ProviderRegistry {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Build a registry from stored configs, honoring `default_id` when it
    /// names one of them.
    pub fn from_configs(
        client: reqwest::Client,
        configs: impl IntoIterator<Item = ProviderConfig>,
        default_id: Option<&str>,
    ) -> Result<Self> {
        let registry = Self::new(client);
        for config in configs {
            registry.add(config)?;
        }
        if let Some(id) = default_id {
            registry.set_default(id)?;
        }
        Ok(registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, config: ProviderConfig) -> Result<()> {
        let adapter = adapter_for(config, self.client.clone())?;
        self.add_adapter(adapter)
    }

    /// Register a prebuilt adapter under its config id.
    pub fn add_adapter(&self, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        let id = adapter.config().id.clone();
        let mut state = self.write();
        if state.adapters.contains_key(&id) {
            return Err(Error::InvalidConfig(format!(
                "provider '{id}' is already registered"
            )));
        }
        state.adapters.insert(id.clone(), adapter);
        state.order.push(id.clone());
        if state.default_id.is_none() {
            state.default_id = Some(id.clone());
        }
        info!(provider = %id, "registered provider");
        Ok(())
    }

    /// Replace the config registered under `config.id`.
    pub fn update(&self, config: ProviderConfig) -> Result<()> {
        let id = config.id.clone();
        if !self.contains(&id) {
            return Err(provider_not_found(&id));
        }
        let adapter = adapter_for(config, self.client.clone())?;
        self.write().adapters.insert(id, adapter);
        Ok(())
    }

    /// Remove a config. When it was the default, the earliest remaining
    /// config takes over.
    pub fn remove(&self, id: &str) -> Result<ProviderConfig> {
        let mut state = self.write();
        let adapter = state
            .adapters
            .remove(id)
            .ok_or_else(|| provider_not_found(id))?;
        state.order.retain(|existing| existing != id);
        if state.default_id.as_deref() == Some(id) {
            state.default_id = state.order.first().cloned();
        }
        Ok(adapter.config().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().adapters.contains_key(id)
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.read()
            .adapters
            .get(id)
            .cloned()
            .ok_or_else(|| provider_not_found(id))
    }

    pub fn config(&self, id: &str) -> Result<ProviderConfig> {
        self.resolve(id).map(|adapter| adapter.config().clone())
    }

    /// Pick the config for a generation: an explicit id must exist, a
    /// character's preferred id is used when it still exists, and the
    /// registry default covers everything else.
    pub fn resolve_id(&self, requested: Option<&str>, preferred: Option<&str>) -> Result<String> {
        if let Some(id) = requested {
            return if self.contains(id) {
                Ok(id.to_string())
            } else {
                Err(provider_not_found(id))
            };
        }
        if let Some(id) = preferred {
            if self.contains(id) {
                return Ok(id.to_string());
            }
            warn!(provider = %id, "preferred provider is not configured, using the default");
        }
        self.default_id()
            .ok_or_else(|| Error::NotFound("default provider (none configured)".to_string()))
    }

    pub fn set_default(&self, id: &str) -> Result<()> {
        let mut state = self.write();
        if !state.adapters.contains_key(id) {
            return Err(provider_not_found(id));
        }
        state.default_id = Some(id.to_string());
        Ok(())
    }

    pub fn default_id(&self) -> Option<String> {
        self.read().default_id.clone()
    }

    /// Configs in the order they were added.
    pub fn configs(&self) -> Vec<ProviderConfig> {
        let state = self.read();
        state
            .order
            .iter()
            .filter_map(|id| state.adapters.get(id))
            .map(|adapter| adapter.config().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn provider_not_found(id: &str) -> Error {
    Error::NotFound(format!("provider '{id}'"))
}
