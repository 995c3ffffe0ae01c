use crate::http::get;
use crate::{CancelToken, ImageProvider, ProviderError};
use wasmxds_schema::{BackendKind, ProviderKey};

pub const DEFAULT_REGION: &str = "us-east-1";

/// Object-storage provider. Locations are `<bucket>/<key...>`.
///
/// Objects are fetched with a path-style GET against `endpoint`, which works
/// for public buckets and S3-compatible local stacks. Request signing happens
/// outside this provider (e.g. a signing proxy in front of the endpoint).
pub struct S3Provider {
    endpoint: String,
    agent: ureq::Agent,
}

impl S3Provider {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            agent: ureq::Agent::new_with_defaults(),
        }
    }

    /// Provider for the public endpoint of an AWS region.
    pub fn for_region(region: &str) -> Self {
        Self::new(&format!("https://s3.{region}.amazonaws.com"))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Split `<bucket>/<key...>` on the first `/`.
pub fn split_location(location: &str) -> Result<(&str, &str), ProviderError> {
    match location.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => Err(ProviderError::InvalidLocation {
            location: location.to_owned(),
            reason: "expected '<bucket>/<path/to/binary>'".to_owned(),
        }),
    }
}

impl ImageProvider for S3Provider {
    fn fetch(&self, cancel: &CancelToken, location: &str) -> Result<Vec<u8>, ProviderError> {
        let (bucket, key) = split_location(location)?;
        get(
            &self.agent,
            &format!("{}/{bucket}/{key}", self.endpoint),
            location,
            cancel,
        )
    }

    fn provider_key(&self) -> ProviderKey {
        ProviderKey::new(BackendKind::S3.as_str())
    }
}
