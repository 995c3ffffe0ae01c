use crate::config_resolver::resolve_config;
use crate::converter::{convert, RuntimeEngine};
use crate::image_cache::ImageCache;
use crate::kvstore::KeyValueStore;
use crate::resource_cache::ResourcePublisher;
use crate::CoreError;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wasmxds_provider::{CancelToken, ProviderError, ProviderRegistry};
use wasmxds_schema::ExtensionResource;

/// Result of a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Published name, `namespace/name`.
    pub name: String,
    /// Whether the binary came from a provider rather than the image cache.
    pub fetched: bool,
    pub runtime: RuntimeEngine,
    /// Set when the declared runtime was unknown and the default was used.
    pub runtime_warning: Option<String>,
}

/// Applies create/update/delete notifications to the resource cache.
///
/// Takes `&mut self` for every mutation: callers serialize access, and the
/// [`Reconciler`](crate::Reconciler) does so by owning the handler on a
/// single worker thread.
pub struct EventHandler {
    providers: ProviderRegistry,
    images: ImageCache,
    store: Arc<dyn KeyValueStore>,
    cache: Arc<dyn ResourcePublisher>,
}

impl EventHandler {
    pub fn new(
        providers: ProviderRegistry,
        store: Arc<dyn KeyValueStore>,
        cache: Arc<dyn ResourcePublisher>,
    ) -> Self {
        Self {
            providers,
            images: ImageCache::new(),
            store,
            cache,
        }
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Fetch, verify, resolve, convert and publish `resource`.
    ///
    /// On error the resource cache is untouched, so a previously published
    /// version of the resource keeps being served. A binary fetched before a
    /// later step failed stays in the image cache, held by this resource
    /// until it publishes another location or is deleted.
    pub fn update(
        &mut self,
        cancel: &CancelToken,
        resource: &ExtensionResource,
    ) -> Result<ReconcileOutcome, CoreError> {
        let identity = resource.identity();
        let name = identity.to_string();
        let image = &resource.spec.image;
        debug!("reconciling {name} from {}", image.id());
        cancel.check()?;

        let key = image.provider_key()?;
        let provider = self
            .providers
            .get(&key)
            .ok_or_else(|| CoreError::UnsupportedProtocol { image: image.id() })?;

        let (binary, fetched) = self.images.get_or_fetch(&identity, &image.location, || {
            info!("fetching {} for {name}", image.id());
            let bytes = provider.fetch(cancel, &image.location)?;
            cancel.check()?;
            Ok::<_, ProviderError>(bytes)
        })?;
        if !fetched {
            debug!("image cache hit for {}", image.location);
        }

        if let Some(expected) = &image.sha256 {
            let actual = hex::encode(Sha256::digest(binary));
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(CoreError::IntegrityMismatch {
                    name,
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let vm_config = resolve_config(
            self.store.as_ref(),
            &resource.namespace,
            resource.spec.vm_configuration.as_ref(),
        )?;
        let plugin_config = resolve_config(
            self.store.as_ref(),
            &resource.namespace,
            resource.spec.plugin_configuration.as_ref(),
        )?;

        let conversion = convert(resource, binary, &plugin_config, &vm_config)?;
        if let Some(warning) = &conversion.runtime_warning {
            warn!("{name}: {warning}");
        }

        cancel.check()?;
        self.cache.publish(&name, conversion.config)?;
        self.images.acquire(&identity, &image.location);
        info!("published {name} (runtime {})", conversion.runtime.as_str());

        Ok(ReconcileOutcome {
            name,
            fetched,
            runtime: conversion.runtime,
            runtime_warning: conversion.runtime_warning,
        })
    }

    /// Retract `resource` and release its image. Idempotent.
    pub fn delete(&mut self, resource: &ExtensionResource) {
        let identity = resource.identity();
        if self.images.release(&identity, &resource.spec.image.location) {
            debug!("released cached image {}", resource.spec.image.location);
        }
        self.cache.retract(&identity.to_string());
        info!("retracted {identity}");
    }
}
