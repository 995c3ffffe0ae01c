//! Registry-backed image provider.
//!
//! Pulls through the distribution client: the manifest for a reference must
//! list only wasm layers, and exactly one of them. Login is lazy: a session
//! (client plus credentials) is created on the first pull and reused, and the
//! client caches the registry token per repository. A rejected pull discards
//! the session and logs in again, bounded by the provider's retry budget.

use crate::{CancelToken, ImageProvider, ProviderError};
use oci_distribution::client::{ClientConfig, ClientProtocol, ImageData};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use wasmxds_schema::{parse_registry_reference, registry_provider_key, ProviderKey};

/// Layer media types that carry a wasm binary.
pub const ALLOWED_MEDIA_TYPES: [&str; 2] = [
    // wasm-to-oci
    "application/vnd.module.wasm.content.layer.v1+wasm",
    // wasm image spec
    "application/vnd.wasm.content.layer.v1+wasm",
];

pub const WEBASSEMBLY_HUB_HOST: &str = "webassemblyhub.io";

/// Default number of forced re-logins after a rejected pull.
pub const DEFAULT_AUTH_RETRIES: u32 = 1;

/// How often a blocked pull checks its cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Https,
    Http,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }

    fn protocol(self) -> ClientProtocol {
        match self {
            Scheme::Https => ClientProtocol::Https,
            Scheme::Http => ClientProtocol::Http,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supplies registry credentials at login time.
pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` means pull anonymously.
    fn credentials(&self, host: &str) -> Result<Option<Credentials>, ProviderError>;
}

pub struct Anonymous;

impl CredentialProvider for Anonymous {
    fn credentials(&self, _host: &str) -> Result<Option<Credentials>, ProviderError> {
        Ok(None)
    }
}

/// Fixed username/password. Empty values fall back to anonymous pulls.
pub struct StaticCredentials(pub Credentials);

impl StaticCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self(Credentials {
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, _host: &str) -> Result<Option<Credentials>, ProviderError> {
        if self.0.username.is_empty() || self.0.password.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.0.clone()))
        }
    }
}

/// A logged-in client. Dropping it forgets the cached registry token.
struct Session {
    client: Client,
    auth: RegistryAuth,
}

/// Why one pull attempt failed.
enum Rejection {
    /// The registry refused the session's authorization.
    Unauthorized(String),
    Failed(ProviderError),
}

/// Provider serving every reference whose host is `host`.
pub struct RegistryProvider {
    host: String,
    scheme: Scheme,
    credentials: Box<dyn CredentialProvider>,
    auth_retries: u32,
    runtime: Runtime,
    session: Mutex<Option<Session>>,
}

impl RegistryProvider {
    pub fn new(
        host: &str,
        scheme: Scheme,
        credentials: Box<dyn CredentialProvider>,
    ) -> Result<Self, ProviderError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ProviderError::fetch_failed(host, format!("registry client runtime: {e}")))?;
        Ok(Self {
            host: host.to_owned(),
            scheme,
            credentials,
            auth_retries: DEFAULT_AUTH_RETRIES,
            runtime,
            session: Mutex::new(None),
        })
    }

    /// Public WebAssembly Hub, pulled anonymously.
    pub fn webassembly_hub() -> Result<Self, ProviderError> {
        Self::new(WEBASSEMBLY_HUB_HOST, Scheme::Https, Box::new(Anonymous))
    }

    /// A plain-HTTP registry on `localhost:<port>`.
    pub fn local(port: u16, credentials: Box<dyn CredentialProvider>) -> Result<Self, ProviderError> {
        Self::new(&format!("localhost:{port}"), Scheme::Http, credentials)
    }

    /// Number of forced re-logins allowed after the registry rejects a pull.
    #[must_use]
    pub fn with_auth_retries(mut self, retries: u32) -> Self {
        self.auth_retries = retries;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn auth_failure(&self, reason: impl ToString) -> ProviderError {
        ProviderError::AuthenticationFailure {
            host: self.host.clone(),
            reason: reason.to_string(),
        }
    }

    /// Take the cached session, or log in with fresh credentials.
    fn take_session(&self) -> Result<Session, ProviderError> {
        let cached = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = cached {
            return Ok(session);
        }
        let auth = match self.credentials.credentials(&self.host)? {
            Some(Credentials { username, password }) => RegistryAuth::Basic(username, password),
            None => RegistryAuth::Anonymous,
        };
        info!("new registry session for {}", self.host);
        let client = Client::new(ClientConfig {
            protocol: self.scheme.protocol(),
            ..ClientConfig::default()
        });
        Ok(Session { client, auth })
    }

    fn keep_session(&self, session: Session) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    /// Drive `fut` to completion unless `cancel` fires first.
    fn block_on<T>(&self, cancel: &CancelToken, fut: impl Future<Output = T>) -> Result<T, ProviderError> {
        self.runtime.block_on(async {
            tokio::select! {
                out = fut => Ok(out),
                () = cancelled(cancel) => Err(ProviderError::Cancelled),
            }
        })
    }

    fn pull(
        &self,
        cancel: &CancelToken,
        reference: &Reference,
        location: &str,
    ) -> Result<Vec<u8>, Rejection> {
        let session = self.take_session().map_err(Rejection::Failed)?;
        let pulled = self
            .block_on(
                cancel,
                session
                    .client
                    .pull(reference, &session.auth, ALLOWED_MEDIA_TYPES.to_vec()),
            )
            .map_err(Rejection::Failed)?;
        match pulled {
            Ok(image) => {
                self.keep_session(session);
                single_wasm_layer(image, location).map_err(Rejection::Failed)
            }
            Err(
                OciDistributionError::AuthenticationFailure(reason)
                | OciDistributionError::UnauthorizedError { url: reason },
            ) => Err(Rejection::Unauthorized(reason)),
            Err(e) => {
                self.keep_session(session);
                Err(Rejection::Failed(classify(e, location)))
            }
        }
    }
}

async fn cancelled(cancel: &CancelToken) {
    while !cancel.is_cancelled() {
        tokio::time::sleep(CANCEL_POLL).await;
    }
}

fn classify(e: OciDistributionError, location: &str) -> ProviderError {
    match e {
        OciDistributionError::PullNoLayersError => {
            ProviderError::invalid_image(location, "expected exactly one wasm layer, found 0")
        }
        OciDistributionError::IncompatibleLayerMediaTypeError(media_type) => {
            ProviderError::invalid_image(location, format!("unexpected layer media type {media_type}"))
        }
        other => ProviderError::fetch_failed(location, other),
    }
}

fn single_wasm_layer(image: ImageData, location: &str) -> Result<Vec<u8>, ProviderError> {
    let mut layers: Vec<_> = image
        .layers
        .into_iter()
        .filter(|layer| ALLOWED_MEDIA_TYPES.contains(&layer.media_type.as_str()))
        .collect();
    if layers.len() != 1 {
        return Err(ProviderError::invalid_image(
            location,
            format!("expected exactly one wasm layer, found {}", layers.len()),
        ));
    }
    Ok(layers.remove(0).data)
}

impl ImageProvider for RegistryProvider {
    fn fetch(&self, cancel: &CancelToken, location: &str) -> Result<Vec<u8>, ProviderError> {
        let reference = parse_registry_reference(location)?;
        if reference.registry() != self.host {
            return Err(ProviderError::InvalidLocation {
                location: location.to_owned(),
                reason: format!("host does not match registry {}", self.host),
            });
        }

        let mut relogins = 0;
        loop {
            cancel.check()?;
            debug!("pulling {location}");
            match self.pull(cancel, &reference, location) {
                Ok(bytes) => return Ok(bytes),
                Err(Rejection::Failed(e)) => return Err(e),
                Err(Rejection::Unauthorized(reason)) => {
                    if relogins >= self.auth_retries {
                        return Err(self.auth_failure(reason));
                    }
                    relogins += 1;
                    warn!(
                        "{} rejected the pull of {location}; logging in again ({relogins}/{})",
                        self.host, self.auth_retries
                    );
                }
            }
        }
    }

    fn provider_key(&self) -> ProviderKey {
        registry_provider_key(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockRequest, MockResponse, MockServer};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const REPO: &str = "filters/example";
    const WASM: &[u8] = b"\0asm\x01\0\0\0";
    const CONFIG: &[u8] = b"{}";
    const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

    fn sha256_digest(bytes: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
    }

    /// Manifest body plus the blobs it points at, config included.
    fn image(layers: &[(&str, &[u8])]) -> (String, HashMap<String, Vec<u8>>) {
        let descriptors: Vec<serde_json::Value> = layers
            .iter()
            .map(|(media_type, data)| {
                serde_json::json!({
                    "mediaType": media_type,
                    "digest": sha256_digest(data),
                    "size": data.len(),
                })
            })
            .collect();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": sha256_digest(CONFIG),
                "size": CONFIG.len(),
            },
            "layers": descriptors,
        })
        .to_string();
        let mut blobs: HashMap<String, Vec<u8>> = layers
            .iter()
            .map(|(_, data)| (sha256_digest(data), data.to_vec()))
            .collect();
        blobs.insert(sha256_digest(CONFIG), CONFIG.to_vec());
        (manifest, blobs)
    }

    fn manifest_response(manifest: &str) -> MockResponse {
        MockResponse::ok(manifest.as_bytes().to_vec())
            .with_header("Content-Type", MANIFEST_MEDIA_TYPE)
            .with_header("Docker-Content-Digest", &sha256_digest(manifest.as_bytes()))
    }

    fn serve_blob(req: &MockRequest, blobs: &HashMap<String, Vec<u8>>) -> Option<MockResponse> {
        let digest = req.path.split("/blobs/").nth(1)?;
        blobs.get(digest).map(|data| MockResponse::ok(data.clone()))
    }

    struct Fixture {
        server: MockServer,
        tokens_issued: Arc<AtomicUsize>,
    }

    /// A bearer-token registry serving one manifest for `REPO:v1`.
    ///
    /// The first `reject` manifest requests answer 401 regardless of token.
    fn registry(layers: &[(&str, &[u8])], reject: usize) -> Fixture {
        let tokens_issued = Arc::new(AtomicUsize::new(0));
        let rejections_left = Arc::new(AtomicUsize::new(reject));
        let (manifest, blobs) = image(layers);

        let issued = Arc::clone(&tokens_issued);
        let server = MockServer::start(move |req: &MockRequest| {
            let host = req.header("host").unwrap_or_default().to_owned();
            let authorized = req
                .header("authorization")
                .is_some_and(|v| v.starts_with("Bearer tok-"));
            if req.path == "/v2/" {
                return MockResponse::status(401).with_header(
                    "WWW-Authenticate",
                    &format!(r#"Bearer realm="http://{host}/token",service="mock-registry""#),
                );
            }
            if req.path.starts_with("/token") {
                let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
                return MockResponse::ok(format!(r#"{{"token":"tok-{n}"}}"#));
            }
            if !authorized {
                return MockResponse::status(401);
            }
            if req.path == format!("/v2/{REPO}/manifests/v1") {
                if rejections_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return MockResponse::status(401);
                }
                return manifest_response(&manifest);
            }
            serve_blob(req, &blobs).unwrap_or_else(|| MockResponse::status(404))
        });

        Fixture {
            server,
            tokens_issued,
        }
    }

    fn provider_for(fixture: &Fixture) -> RegistryProvider {
        RegistryProvider::new(&fixture.server.addr, Scheme::Http, Box::new(Anonymous)).unwrap()
    }

    fn location(fixture: &Fixture) -> String {
        format!("{}/{REPO}:v1", fixture.server.addr)
    }

    fn logins(server: &MockServer) -> usize {
        server.requests().iter().filter(|r| r.path == "/v2/").count()
    }

    #[test]
    fn pulls_single_wasm_layer() {
        let fixture = registry(&[(ALLOWED_MEDIA_TYPES[0], WASM)], 0);
        let provider = provider_for(&fixture);
        let bytes = provider
            .fetch(&CancelToken::new(), &location(&fixture))
            .unwrap();
        assert_eq!(bytes, WASM);
        assert_eq!(fixture.tokens_issued.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_pull_reuses_login() {
        let fixture = registry(&[(ALLOWED_MEDIA_TYPES[1], WASM)], 0);
        let provider = provider_for(&fixture);
        provider.fetch(&CancelToken::new(), &location(&fixture)).unwrap();
        provider.fetch(&CancelToken::new(), &location(&fixture)).unwrap();
        assert_eq!(fixture.tokens_issued.load(Ordering::SeqCst), 1);
        assert_eq!(logins(&fixture.server), 1);
        assert_eq!(fixture.server.count(&format!("/v2/{REPO}/manifests/")), 2);
    }

    #[test]
    fn rejected_pull_logs_in_again_once() {
        let fixture = registry(&[(ALLOWED_MEDIA_TYPES[0], WASM)], 1);
        let provider = provider_for(&fixture);
        let bytes = provider
            .fetch(&CancelToken::new(), &location(&fixture))
            .unwrap();
        assert_eq!(bytes, WASM);
        assert_eq!(fixture.tokens_issued.load(Ordering::SeqCst), 2);
        assert_eq!(logins(&fixture.server), 2);
    }

    #[test]
    fn repeated_rejection_is_authentication_failure() {
        let fixture = registry(&[(ALLOWED_MEDIA_TYPES[0], WASM)], usize::MAX);
        let provider = provider_for(&fixture);
        let err = provider
            .fetch(&CancelToken::new(), &location(&fixture))
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailure { .. }), "{err}");
        assert_eq!(fixture.tokens_issued.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retry_budget_bounds_relogins() {
        let fixture = registry(&[(ALLOWED_MEDIA_TYPES[0], WASM)], usize::MAX);
        let provider = provider_for(&fixture).with_auth_retries(3);
        assert!(provider.fetch(&CancelToken::new(), &location(&fixture)).is_err());
        assert_eq!(fixture.tokens_issued.load(Ordering::SeqCst), 4);

        let fixture = registry(&[(ALLOWED_MEDIA_TYPES[0], WASM)], usize::MAX);
        let provider = provider_for(&fixture).with_auth_retries(0);
        assert!(provider.fetch(&CancelToken::new(), &location(&fixture)).is_err());
        assert_eq!(fixture.tokens_issued.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refused_token_request_is_authentication_failure() {
        let server = MockServer::start(|req| {
            let host = req.header("host").unwrap_or_default().to_owned();
            if req.path == "/v2/" {
                MockResponse::status(401).with_header(
                    "WWW-Authenticate",
                    &format!(r#"Bearer realm="http://{host}/token""#),
                )
            } else {
                MockResponse::status(403)
            }
        });
        let provider = RegistryProvider::new(
            &server.addr,
            Scheme::Http,
            Box::new(StaticCredentials::new("user", "wrong")),
        )
        .unwrap();
        let err = provider
            .fetch(&CancelToken::new(), &format!("{}/{REPO}:v1", server.addr))
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailure { .. }), "{err}");
        assert_eq!(server.count("/token"), 2);
    }

    #[test]
    fn two_wasm_layers_is_invalid_image() {
        let fixture = registry(
            &[(ALLOWED_MEDIA_TYPES[0], WASM), (ALLOWED_MEDIA_TYPES[1], &b"other"[..])],
            0,
        );
        let err = provider_for(&fixture)
            .fetch(&CancelToken::new(), &location(&fixture))
            .unwrap_err();
        match err {
            ProviderError::InvalidImage { reason, .. } => assert!(reason.contains("found 2")),
            other => panic!("expected InvalidImage, got {other:?}"),
        }
    }

    #[test]
    fn non_wasm_layer_is_invalid_image() {
        let fixture = registry(&[("application/vnd.oci.image.layer.v1.tar+gzip", WASM)], 0);
        let err = provider_for(&fixture)
            .fetch(&CancelToken::new(), &location(&fixture))
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidImage { .. }), "{err}");
    }

    #[test]
    fn no_layers_is_invalid_image() {
        let fixture = registry(&[], 0);
        let err = provider_for(&fixture)
            .fetch(&CancelToken::new(), &location(&fixture))
            .unwrap_err();
        match err {
            ProviderError::InvalidImage { reason, .. } => assert!(reason.contains("found 0")),
            other => panic!("expected InvalidImage, got {other:?}"),
        }
    }

    #[test]
    fn missing_manifest_is_fetch_failed() {
        let fixture = registry(&[(ALLOWED_MEDIA_TYPES[0], WASM)], 0);
        let err = provider_for(&fixture)
            .fetch(&CancelToken::new(), &format!("{}/{REPO}:v2", fixture.server.addr))
            .unwrap_err();
        assert!(matches!(err, ProviderError::FetchFailed { .. }), "{err}");
    }

    #[test]
    fn other_host_is_invalid_location() {
        let provider =
            RegistryProvider::new("registry.example.com", Scheme::Https, Box::new(Anonymous))
                .unwrap();
        let err = provider
            .fetch(&CancelToken::new(), "other.example.com/a:v1")
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidLocation { .. }), "{err}");
    }

    #[test]
    fn malformed_reference_is_rejected_before_network() {
        let provider = RegistryProvider::webassembly_hub().unwrap();
        let err = provider.fetch(&CancelToken::new(), "not a reference").unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Schema(wasmxds_schema::SchemaError::InvalidReference { .. })
        ));
    }

    #[test]
    fn anonymous_registry_sends_no_authorization() {
        let (manifest, blobs) = image(&[(ALLOWED_MEDIA_TYPES[0], WASM)]);
        let server = MockServer::start(move |req| {
            if req.path == "/v2/" {
                MockResponse::ok(b"{}".to_vec())
            } else if req.path.contains("/manifests/") {
                manifest_response(&manifest)
            } else {
                serve_blob(req, &blobs).unwrap_or_else(|| MockResponse::status(404))
            }
        });
        let provider =
            RegistryProvider::new(&server.addr, Scheme::Http, Box::new(Anonymous)).unwrap();
        let bytes = provider
            .fetch(&CancelToken::new(), &format!("{}/open/filter:v1", server.addr))
            .unwrap();
        assert_eq!(bytes, WASM);
        assert!(server
            .requests()
            .iter()
            .all(|r| r.header("authorization").is_none()));
    }

    #[test]
    fn static_credentials_are_sent_to_token_endpoint() {
        let fixture = registry(&[(ALLOWED_MEDIA_TYPES[0], WASM)], 0);
        let provider = RegistryProvider::new(
            &fixture.server.addr,
            Scheme::Http,
            Box::new(StaticCredentials::new("user", "pass")),
        )
        .unwrap();
        provider.fetch(&CancelToken::new(), &location(&fixture)).unwrap();
        let token_req = fixture
            .server
            .requests()
            .into_iter()
            .find(|r| r.path.starts_with("/token"))
            .unwrap();
        assert_eq!(
            token_req.header("authorization"),
            Some(format!("Basic {}", STANDARD.encode("user:pass")).as_str())
        );
        assert!(token_req.path.contains("scope=repository"));
    }

    #[test]
    fn cancelled_token_stops_before_login() {
        let fixture = registry(&[(ALLOWED_MEDIA_TYPES[0], WASM)], 0);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = provider_for(&fixture)
            .fetch(&cancel, &location(&fixture))
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
        assert!(fixture.server.requests().is_empty());
    }

    #[test]
    fn provider_key_includes_host() {
        assert_eq!(
            RegistryProvider::webassembly_hub().unwrap().provider_key(),
            "oci||webassemblyhub.io"
        );
        assert_eq!(
            RegistryProvider::local(5000, Box::new(Anonymous))
                .unwrap()
                .provider_key(),
            "oci||localhost:5000"
        );
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = StaticCredentials::new("u", "secret").0;
        assert!(!format!("{creds:?}").contains("secret"));
    }
}
