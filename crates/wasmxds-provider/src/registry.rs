use crate::{ImageProvider, ProviderError};
use std::collections::HashMap;
use tracing::{info, warn};
use wasmxds_schema::ProviderKey;

/// Provider lookup table keyed by [`ProviderKey`].
///
/// Built once at startup and read-only afterwards.
pub struct ProviderRegistry {
    providers: HashMap<ProviderKey, Box<dyn ImageProvider>>,
}

impl ProviderRegistry {
    /// Register `providers` under their own keys.
    ///
    /// A later provider with the same key replaces an earlier one.
    pub fn new(providers: Vec<Box<dyn ImageProvider>>) -> Result<Self, ProviderError> {
        if providers.is_empty() {
            return Err(ProviderError::NoProviders);
        }
        let mut map = HashMap::with_capacity(providers.len());
        for provider in providers {
            let key = provider.provider_key();
            if map.insert(key.clone(), provider).is_some() {
                warn!("provider {key} registered twice; keeping the last one");
            }
        }
        let registry = Self { providers: map };
        for key in registry.keys() {
            info!("image provider configured: {key}");
        }
        Ok(registry)
    }

    pub fn get(&self, key: &ProviderKey) -> Option<&dyn ImageProvider> {
        self.providers.get(key).map(Box::as_ref)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&ProviderKey> {
        let mut keys: Vec<&ProviderKey> = self.providers.keys().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("keys", &self.keys())
            .finish()
    }
}
