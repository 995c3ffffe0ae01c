use crate::{CancelToken, ImageProvider, ProviderError};
use wasmxds_schema::{BackendKind, ProviderKey};

/// Reads binaries straight from the local filesystem; the location is a path.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFsProvider;

impl ImageProvider for LocalFsProvider {
    fn fetch(&self, cancel: &CancelToken, location: &str) -> Result<Vec<u8>, ProviderError> {
        cancel.check()?;
        tracing::debug!("reading {location}");
        std::fs::read(location).map_err(|e| ProviderError::fetch_failed(location, e))
    }

    fn provider_key(&self) -> ProviderKey {
        ProviderKey::new(BackendKind::LocalFs.as_str())
    }
}
