//! Image providers for fetching WebAssembly filter binaries.
//!
//! Every backend implements [`ImageProvider`]: fetch raw bytes for a
//! backend-specific location string, and report the stable provider key the
//! resolver in `wasmxds-schema` computes for it. The [`ProviderRegistry`]
//! maps keys to providers and is built once at startup from
//! [`ProvidersConfig`].
//!
//! Providers never cache fetched bytes; that is the event handler's job.

pub mod cancel;
pub mod config;
pub mod ecr;
pub mod http;
pub mod localfs;
pub mod oci;
pub mod registry;
pub mod s3;

#[cfg(test)]
pub(crate) mod testutil;

pub use cancel::CancelToken;
pub use config::{EcrConfig, HttpsConfig, ProvidersConfig, RegistryConfig, S3Config};
pub use ecr::{AuthorizationTokenSource, AwsEcr, EcrCredentials};
pub use http::{HttpProvider, HttpsProvider};
pub use localfs::LocalFsProvider;
pub use oci::{Anonymous, CredentialProvider, Credentials, RegistryProvider, Scheme, StaticCredentials};
pub use registry::ProviderRegistry;
pub use s3::S3Provider;

use thiserror::Error;
use wasmxds_schema::{ProviderKey, SchemaError};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("invalid location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },
    #[error("failed to fetch '{location}': {reason}")]
    FetchFailed { location: String, reason: String },
    #[error("authentication failed for {host}: {reason}")]
    AuthenticationFailure { host: String, reason: String },
    #[error("invalid image '{location}': {reason}")]
    InvalidImage { location: String, reason: String },
    #[error("at least one image provider must be configured")]
    NoProviders,
}

impl ProviderError {
    pub(crate) fn fetch_failed(location: &str, reason: impl ToString) -> Self {
        Self::FetchFailed {
            location: location.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_image(location: &str, reason: impl ToString) -> Self {
        Self::InvalidImage {
            location: location.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// A source of filter binaries for one backend kind (or one registry host).
pub trait ImageProvider: Send + Sync {
    /// Fetch the raw binary at `location`.
    ///
    /// Implementations check `cancel` before each network or disk round trip
    /// and return [`ProviderError::Cancelled`] once it fires.
    fn fetch(&self, cancel: &CancelToken, location: &str) -> Result<Vec<u8>, ProviderError>;

    /// Key under which this provider is registered.
    fn provider_key(&self) -> ProviderKey;
}
