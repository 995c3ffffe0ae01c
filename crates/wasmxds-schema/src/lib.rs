//! Extension resource model and provider key resolution for wasmxds.
//!
//! This crate defines the schema layer: the declarative `ExtensionResource`
//! (image location, backend kind, integrity hash, runtime, and the two
//! configuration blobs), TOML/JSON parsing, registry reference parsing
//! (`parse_registry_reference`), and the pure provider key resolver
//! (`resolve_provider_key`) that routes an image to its provider.

pub mod backend;
pub mod extension;
pub mod types;

pub use backend::{
    parse_registry_reference, registry_provider_key, resolve_provider_key, BackendKind,
};
pub use extension::{
    parse_resource_file, parse_resource_json, parse_resource_str, ConfigValue, ConfigValueRef,
    ExtensionResource, ExtensionSpec, ImageSpec, KeyRef,
};
pub use types::{NamespacedName, ProviderKey};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read resource file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse resource: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to parse resource: {0}")]
    ParseJson(#[from] serde_json::Error),
    #[error("unsupported protocol: '{0}'")]
    UnsupportedProtocol(String),
    #[error("invalid registry reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },
    #[error("invalid resource identity: '{0}', expected '<namespace>/<name>'")]
    InvalidIdentity(String),
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
}
