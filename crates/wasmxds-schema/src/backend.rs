use crate::types::ProviderKey;
use crate::SchemaError;
use oci_distribution::Reference;
use std::fmt;

/// Protocol family used to retrieve a filter binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Content-addressed (OCI) registry.
    Oci,
    LocalFs,
    S3,
    Http,
    Https,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Oci,
        BackendKind::LocalFs,
        BackendKind::S3,
        BackendKind::Http,
        BackendKind::Https,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Oci => "oci",
            BackendKind::LocalFs => "local_fs",
            BackendKind::S3 => "s3",
            BackendKind::Http => "http",
            BackendKind::Https => "https",
        }
    }

    /// Parse a declared backend kind. An empty string selects the registry.
    pub fn parse(declared: &str) -> Result<Self, SchemaError> {
        if declared.is_empty() {
            return Ok(BackendKind::Oci);
        }
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == declared)
            .ok_or_else(|| SchemaError::UnsupportedProtocol(declared.to_owned()))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider key for a registry provider serving `host`.
///
/// One registry provider instance exists per host, so resources only need to
/// declare a reference and the host routes them.
pub fn registry_provider_key(host: &str) -> ProviderKey {
    ProviderKey::new(format!("{}||{host}", BackendKind::Oci.as_str()))
}

/// Parse a registry reference, `[host[:port]/]repository[:tag][@digest]`.
///
/// A reference without a registry host resolves to Docker Hub, as the
/// distribution client does.
pub fn parse_registry_reference(location: &str) -> Result<Reference, SchemaError> {
    Reference::try_from(location).map_err(|e| SchemaError::InvalidReference {
        reference: location.to_owned(),
        reason: e.to_string(),
    })
}

/// Compute the key used to look up the image provider for an image.
///
/// Pure: the output depends only on the inputs.
pub fn resolve_provider_key(backend: &str, location: &str) -> Result<ProviderKey, SchemaError> {
    match BackendKind::parse(backend)? {
        BackendKind::Oci => {
            let reference = parse_registry_reference(location)?;
            Ok(registry_provider_key(reference.registry()))
        }
        kind => Ok(ProviderKey::new(kind.as_str())),
    }
}
