use crate::backend::{resolve_provider_key, BackendKind};
use crate::types::{NamespacedName, ProviderKey};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One managed WebAssembly filter instance.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExtensionResource {
    pub namespace: String,
    pub name: String,
    pub spec: ExtensionSpec,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExtensionSpec {
    pub image: ImageSpec,
    #[serde(default)]
    pub vm_id: String,
    #[serde(default)]
    pub root_id: String,
    /// Wasm runtime, matched case-insensitively. Empty selects the default.
    #[serde(default)]
    pub runtime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_configuration: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_configuration: Option<ConfigValue>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImageSpec {
    #[serde(alias = "uri")]
    pub location: String,
    /// Backend kind; empty means the registry.
    #[serde(default, alias = "protocol")]
    pub backend: String,
    /// Expected hex-encoded SHA-256 of the binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ImageSpec {
    pub fn new(backend: &str, location: &str) -> Self {
        Self {
            location: location.to_owned(),
            backend: backend.to_owned(),
            sha256: None,
        }
    }

    #[must_use]
    pub fn with_sha256(mut self, sha256: &str) -> Self {
        self.sha256 = Some(sha256.to_owned());
        self
    }

    pub fn provider_key(&self) -> Result<ProviderKey, SchemaError> {
        resolve_provider_key(&self.backend, &self.location)
    }

    /// `<backend>://<location>`, for logs and error context.
    pub fn id(&self) -> String {
        let backend = if self.backend.is_empty() {
            BackendKind::Oci.as_str()
        } else {
            &self.backend
        };
        format!("{backend}://{}", self.location)
    }
}

/// A configuration blob: inline, or a reference into a key/value store.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, alias = "valueFrom", skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ConfigValueRef>,
}

impl ConfigValue {
    pub fn inline(value: &str) -> Self {
        Self {
            value: Some(value.to_owned()),
            value_from: None,
        }
    }

    pub fn from_config_map(key_ref: KeyRef) -> Self {
        Self {
            value: None,
            value_from: Some(ConfigValueRef {
                secret_key_ref: None,
                config_map_key_ref: Some(key_ref),
            }),
        }
    }

    pub fn from_secret(key_ref: KeyRef) -> Self {
        Self {
            value: None,
            value_from: Some(ConfigValueRef {
                secret_key_ref: Some(key_ref),
                config_map_key_ref: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigValueRef {
    #[serde(default, alias = "secretKeyRef", skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeyRef>,
    #[serde(default, alias = "configMapKeyRef", skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeyRef>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KeyRef {
    pub name: String,
    /// Namespace of the referenced object; empty means the resource's own.
    #[serde(default)]
    pub namespace: String,
    pub key: String,
}

impl KeyRef {
    pub fn new(namespace: &str, name: &str, key: &str) -> Self {
        Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            key: key.to_owned(),
        }
    }
}

impl ExtensionResource {
    pub fn new(namespace: &str, name: &str, spec: ExtensionSpec) -> Self {
        Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            spec,
        }
    }

    pub fn identity(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.as_str(), self.name.as_str())
    }

    /// Structural checks that do not touch any backend.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(SchemaError::InvalidIdentity(self.identity().to_string()));
        }
        if self.name.is_empty() || self.name.contains('/') {
            return Err(SchemaError::InvalidIdentity(self.identity().to_string()));
        }
        if self.spec.image.location.is_empty() {
            return Err(SchemaError::EmptyField("spec.image.location"));
        }
        BackendKind::parse(&self.spec.image.backend)?;
        Ok(())
    }
}

pub fn parse_resource_str(input: &str) -> Result<ExtensionResource, SchemaError> {
    let resource: ExtensionResource = toml::from_str(input)?;
    resource.validate()?;
    Ok(resource)
}

pub fn parse_resource_json(input: &[u8]) -> Result<ExtensionResource, SchemaError> {
    let resource: ExtensionResource = serde_json::from_slice(input)?;
    resource.validate()?;
    Ok(resource)
}

/// Parse a resource file; `.json` files are JSON, anything else TOML.
pub fn parse_resource_file(path: impl AsRef<Path>) -> Result<ExtensionResource, SchemaError> {
    let path = path.as_ref();
    let content = fs::read(path)?;
    if path.extension().is_some_and(|ext| ext == "json") {
        parse_resource_json(&content)
    } else {
        let text = String::from_utf8(content)
            .map_err(|e| SchemaError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        parse_resource_str(&text)
    }
}
