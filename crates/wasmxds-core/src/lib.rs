//! Reconciliation pipeline for wasmxds.
//!
//! This crate turns extension resources into published
//! `TypedExtensionConfig` resources: the [`EventHandler`] resolves a
//! provider, fetches the binary through the [`ImageCache`], verifies its
//! integrity, resolves both configuration blobs against a
//! [`KeyValueStore`], converts, and publishes into the [`ResourceCache`].
//! The [`Reconciler`] is the single worker thread that drives the handler
//! from a queue of notifications.

pub mod config_resolver;
pub mod converter;
pub mod handler;
pub mod image_cache;
pub mod kvstore;
pub mod reconciler;
pub mod resource_cache;

pub use config_resolver::resolve_config;
pub use converter::{convert, select_runtime, Any, Conversion, RuntimeEngine, TypedExtensionConfig};
pub use handler::{EventHandler, ReconcileOutcome};
pub use image_cache::ImageCache;
pub use kvstore::{DirStore, KeyValueStore, KvObject, MemoryStore, StoreKind};
pub use reconciler::{Notification, Reconciler, ReconcilerConfig, ReconcilerHandle};
pub use resource_cache::{
    CacheEvent, ChangeKind, PublishedResource, ResourceCache, ResourcePublisher, Snapshot,
};

use thiserror::Error;
use wasmxds_provider::ProviderError;
use wasmxds_schema::SchemaError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Provider(ProviderError),
    #[error("unsupported protocol: no provider for {image}")]
    UnsupportedProtocol { image: String },
    #[error("integrity check failed for {name}: expected sha256 {expected}, got {actual}")]
    IntegrityMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("missing configuration: {0}")]
    MissingConfiguration(String),
    #[error("failed to look up {kind} {namespace}/{name}: {reason}")]
    LookupFailed {
        kind: StoreKind,
        namespace: String,
        name: String,
        reason: String,
    },
    #[error("key '{key}' not found in {kind} {namespace}/{name}")]
    KeyNotFound {
        kind: StoreKind,
        namespace: String,
        name: String,
        key: String,
    },
    #[error("conversion failed: {0}")]
    ConversionFailed(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl From<ProviderError> for CoreError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Cancelled => CoreError::Cancelled,
            ProviderError::Schema(e) => CoreError::Schema(e),
            other => CoreError::Provider(other),
        }
    }
}

/// Flat classification of [`CoreError`], for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    UnsupportedProtocol,
    InvalidReference,
    InvalidLocation,
    InvalidResource,
    FetchFailed,
    AuthenticationFailure,
    InvalidImage,
    IntegrityMismatch,
    MissingConfiguration,
    LookupFailed,
    KeyNotFound,
    ConversionFailed,
    Cancelled,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Schema(SchemaError::UnsupportedProtocol(_))
            | CoreError::UnsupportedProtocol { .. } => ErrorKind::UnsupportedProtocol,
            CoreError::Schema(SchemaError::InvalidReference { .. }) => ErrorKind::InvalidReference,
            CoreError::Schema(_) => ErrorKind::InvalidResource,
            CoreError::Provider(e) => match e {
                ProviderError::InvalidLocation { .. } => ErrorKind::InvalidLocation,
                ProviderError::AuthenticationFailure { .. } => ErrorKind::AuthenticationFailure,
                ProviderError::InvalidImage { .. } => ErrorKind::InvalidImage,
                ProviderError::Cancelled => ErrorKind::Cancelled,
                ProviderError::Schema(SchemaError::InvalidReference { .. }) => {
                    ErrorKind::InvalidReference
                }
                ProviderError::Schema(_) => ErrorKind::InvalidResource,
                ProviderError::FetchFailed { .. } | ProviderError::NoProviders => {
                    ErrorKind::FetchFailed
                }
            },
            CoreError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            CoreError::MissingConfiguration(_) => ErrorKind::MissingConfiguration,
            CoreError::LookupFailed { .. } => ErrorKind::LookupFailed,
            CoreError::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            CoreError::ConversionFailed(_) => ErrorKind::ConversionFailed,
            CoreError::Cancelled => ErrorKind::Cancelled,
        }
    }
}
