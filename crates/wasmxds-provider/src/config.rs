use crate::ecr::{ecr_providers, AuthorizationTokenSource, AwsEcr, DEFAULT_REGIONS};
use crate::oci::{Anonymous, CredentialProvider, StaticCredentials, DEFAULT_AUTH_RETRIES, WEBASSEMBLY_HUB_HOST};
use crate::s3::DEFAULT_REGION;
use crate::{
    HttpProvider, HttpsProvider, ImageProvider, LocalFsProvider, ProviderError, ProviderRegistry,
    RegistryProvider, S3Provider, Scheme,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Which providers to build, and how.
///
/// Deserialized from the `[providers]` table of the bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvidersConfig {
    pub http: bool,
    pub https: HttpsConfig,
    pub local_fs: bool,
    pub registry: Vec<RegistryConfig>,
    pub ecr: EcrConfig,
    pub s3: Option<S3Config>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            http: true,
            https: HttpsConfig::default(),
            local_fs: true,
            registry: vec![
                RegistryConfig::new(WEBASSEMBLY_HUB_HOST, Scheme::Https),
                RegistryConfig::new("localhost:5000", Scheme::Http),
            ],
            ecr: EcrConfig::default(),
            s3: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpsConfig {
    pub enabled: bool,
    /// Skip server certificate verification.
    pub insecure: bool,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            insecure: false,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    pub host: String,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_auth_retries")]
    pub auth_retries: u32,
}

fn default_auth_retries() -> u32 {
    DEFAULT_AUTH_RETRIES
}

impl RegistryConfig {
    pub fn new(host: &str, scheme: Scheme) -> Self {
        Self {
            host: host.to_owned(),
            scheme,
            username: String::new(),
            password: String::new(),
            auth_retries: DEFAULT_AUTH_RETRIES,
        }
    }

    fn build(&self) -> Result<RegistryProvider, ProviderError> {
        let credentials: Box<dyn CredentialProvider> =
            if self.username.is_empty() && self.password.is_empty() {
                Box::new(Anonymous)
            } else {
                Box::new(StaticCredentials::new(&self.username, &self.password))
            };
        Ok(RegistryProvider::new(&self.host, self.scheme, credentials)?
            .with_auth_retries(self.auth_retries))
    }
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("host", &self.host)
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth_retries", &self.auth_retries)
            .finish()
    }
}

/// Amazon ECR registries of one account, one provider per region.
///
/// Credentials come from the AWS default chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EcrConfig {
    pub enabled: bool,
    /// Looked up from the caller identity when unset.
    pub account_id: Option<String>,
    pub regions: Vec<String>,
    pub auth_retries: u32,
}

impl Default for EcrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            account_id: None,
            regions: DEFAULT_REGIONS.iter().map(|r| (*r).to_owned()).collect(),
            auth_retries: DEFAULT_AUTH_RETRIES,
        }
    }
}

impl EcrConfig {
    fn build(&self) -> Result<Vec<RegistryProvider>, ProviderError> {
        let aws = AwsEcr::from_env()?;
        let account = match &self.account_id {
            Some(account) => account.clone(),
            None => aws.account_id()?,
        };
        info!("serving ECR registries of {account} in {} region(s)", self.regions.len());
        let source: Arc<dyn AuthorizationTokenSource> = Arc::new(aws);
        ecr_providers(&account, &self.regions, &source, self.auth_retries)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct S3Config {
    /// Overrides the regional AWS endpoint, e.g. for S3-compatible stores.
    pub endpoint: Option<String>,
    pub region: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: DEFAULT_REGION.to_owned(),
        }
    }
}

impl ProvidersConfig {
    /// Build every enabled provider into a registry.
    pub fn build(&self) -> Result<ProviderRegistry, ProviderError> {
        let mut providers: Vec<Box<dyn ImageProvider>> = Vec::new();
        if self.http {
            providers.push(Box::new(HttpProvider::new()));
        }
        if self.https.enabled {
            providers.push(Box::new(HttpsProvider::new(self.https.insecure)));
        }
        if self.local_fs {
            providers.push(Box::new(LocalFsProvider));
        }
        for registry in &self.registry {
            providers.push(Box::new(registry.build()?));
        }
        if self.ecr.enabled {
            for provider in self.ecr.build()? {
                providers.push(Box::new(provider));
            }
        }
        if let Some(s3) = &self.s3 {
            let provider = match &s3.endpoint {
                Some(endpoint) => S3Provider::new(endpoint),
                None => S3Provider::for_region(&s3.region),
            };
            providers.push(Box::new(provider));
        }
        ProviderRegistry::new(providers)
    }
}
