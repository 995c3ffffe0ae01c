//! Amazon ECR registries.
//!
//! Private ECR registries live at `<account>.dkr.ecr.<region>.amazonaws.com`.
//! One [`RegistryProvider`] is built per region, so a resource only declares
//! its image reference and the host routes it. Each provider logs in with a
//! short-lived token from `GetAuthorizationToken`, fetched again on every
//! fresh login.

use crate::oci::{CredentialProvider, Credentials, RegistryProvider, Scheme};
use crate::ProviderError;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_ecr::error::DisplayErrorContext;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Regions of the standard AWS partition.
pub const DEFAULT_REGIONS: [&str; 29] = [
    "af-south-1",
    "ap-east-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ca-central-1",
    "ca-west-1",
    "eu-central-1",
    "eu-central-2",
    "eu-north-1",
    "eu-south-1",
    "eu-south-2",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "il-central-1",
    "me-central-1",
    "me-south-1",
    "sa-east-1",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
];

pub fn ecr_host(account: &str, region: &str) -> String {
    format!("{account}.dkr.ecr.{region}.amazonaws.com")
}

/// Issues ECR authorization tokens.
pub trait AuthorizationTokenSource: Send + Sync {
    /// Base64 of `user:password`, valid for the registries of `region`.
    fn authorization_token(&self, region: &str) -> Result<String, ProviderError>;
}

/// Registry credentials for one ECR region.
pub struct EcrCredentials {
    region: String,
    source: Arc<dyn AuthorizationTokenSource>,
}

impl EcrCredentials {
    pub fn new(region: &str, source: Arc<dyn AuthorizationTokenSource>) -> Self {
        Self {
            region: region.to_owned(),
            source,
        }
    }
}

impl CredentialProvider for EcrCredentials {
    fn credentials(&self, host: &str) -> Result<Option<Credentials>, ProviderError> {
        debug!("requesting ECR authorization token for {}", self.region);
        let token = self.source.authorization_token(&self.region)?;
        decode_authorization_token(host, &token).map(Some)
    }
}

/// Split a `GetAuthorizationToken` token into username and password.
pub fn decode_authorization_token(host: &str, token: &str) -> Result<Credentials, ProviderError> {
    let failure = |reason: String| ProviderError::AuthenticationFailure {
        host: host.to_owned(),
        reason,
    };
    let decoded = STANDARD
        .decode(token.trim())
        .map_err(|e| failure(format!("authorization token is not base64: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| failure("authorization token is not UTF-8".to_owned()))?;
    match decoded.split_once(':') {
        Some((username, password)) if !username.is_empty() && !password.is_empty() => {
            Ok(Credentials {
                username: username.to_owned(),
                password: password.to_owned(),
            })
        }
        _ => Err(failure(
            "authorization token is not of the form user:password".to_owned(),
        )),
    }
}

/// One registry provider per region for `account`.
pub fn ecr_providers(
    account: &str,
    regions: &[String],
    source: &Arc<dyn AuthorizationTokenSource>,
    auth_retries: u32,
) -> Result<Vec<RegistryProvider>, ProviderError> {
    regions
        .iter()
        .map(|region| {
            let credentials = EcrCredentials::new(region, Arc::clone(source));
            RegistryProvider::new(&ecr_host(account, region), Scheme::Https, Box::new(credentials))
                .map(|provider| provider.with_auth_retries(auth_retries))
        })
        .collect()
}

/// Token source backed by the AWS SDK and the default credential chain.
pub struct AwsEcr {
    runtime: Runtime,
    config: SdkConfig,
}

impl AwsEcr {
    /// Load region and credentials from the environment, profile, or
    /// instance metadata.
    pub fn from_env() -> Result<Self, ProviderError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| aws_failure("aws", format!("runtime: {e}")))?;
        let config = runtime.block_on(aws_config::defaults(BehaviorVersion::latest()).load());
        Ok(Self { runtime, config })
    }

    /// The account the loaded credentials belong to.
    pub fn account_id(&self) -> Result<String, ProviderError> {
        let client = aws_sdk_sts::Client::new(&self.config);
        let identity = self
            .runtime
            .block_on(client.get_caller_identity().send())
            .map_err(|e| aws_failure("sts.amazonaws.com", DisplayErrorContext(&e)))?;
        let account = identity
            .account()
            .ok_or_else(|| aws_failure("sts.amazonaws.com", "caller identity has no account"))?;
        info!("using ECR registries of account {account}");
        Ok(account.to_owned())
    }
}

impl AuthorizationTokenSource for AwsEcr {
    fn authorization_token(&self, region: &str) -> Result<String, ProviderError> {
        let endpoint = format!("api.ecr.{region}.amazonaws.com");
        let config = aws_sdk_ecr::config::Builder::from(&self.config)
            .region(aws_sdk_ecr::config::Region::new(region.to_owned()))
            .build();
        let client = aws_sdk_ecr::Client::from_conf(config);
        let output = self
            .runtime
            .block_on(client.get_authorization_token().send())
            .map_err(|e| aws_failure(&endpoint, DisplayErrorContext(&e)))?;
        output
            .authorization_data()
            .first()
            .and_then(|data| data.authorization_token())
            .map(str::to_owned)
            .ok_or_else(|| aws_failure(&endpoint, "no authorization data in response"))
    }
}

fn aws_failure(host: &str, reason: impl ToString) -> ProviderError {
    ProviderError::AuthenticationFailure {
        host: host.to_owned(),
        reason: reason.to_string(),
    }
}
