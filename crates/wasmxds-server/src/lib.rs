//! HTTP front end for the wasmxds bridge.
//!
//! Serves the resource cache to proxies over a JSON rendition of the
//! extension config discovery API, and accepts extension resources on an
//! admin API that feeds the reconciler:
//!
//! - `POST /v3/discovery:extension_configs`: current snapshot; long-polls
//!   while the caller's `version_info` is current.
//! - `PUT /extensions`: apply a resource (TOML, or JSON with a JSON content type).
//! - `DELETE /extensions/{namespace}/{name}`: delete a resource.
//! - `GET /resources`, `GET /resources/{namespace}/{name}`: inspect published resources.
//! - `GET /health`.
//!
//! The [`TestServer`] helper runs the whole bridge on a random port for
//! integration testing.

pub mod config;

pub use config::ServerConfig;

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};
use wasmxds_core::converter::TYPED_EXTENSION_CONFIG_TYPE_URL;
use wasmxds_core::{
    Any, EventHandler, KeyValueStore, Notification, Reconciler, ReconcilerConfig,
    ReconcilerHandle, ResourceCache, ResourcePublisher,
};
use wasmxds_provider::{CancelToken, ProviderError};
use wasmxds_schema::{parse_resource_json, parse_resource_str, NamespacedName, SchemaError};

pub const DISCOVERY_PATH: &str = "/v3/discovery:extension_configs";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to read config {}: {source}", path.display())]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    ParseConfig {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryRequest {
    pub version_info: String,
    pub resource_names: Vec<String>,
    pub type_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub version_info: String,
    pub resources: Vec<Any>,
    pub type_url: String,
    pub nonce: String,
}

/// State shared by all request threads.
pub struct AppState {
    pub cache: Arc<ResourceCache>,
    pub notifications: Sender<Notification>,
    pub poll_timeout: Duration,
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_json(req: tiny_http::Request, code: u16, body: &impl Serialize) {
    let json = match serde_json::to_vec(body) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to serialize response: {e}");
            respond_err(req, 500, "serialization error");
            return;
        }
    };
    let mut response = Response::from_data(json).with_status_code(StatusCode(code));
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(header);
    }
    let _ = req.respond(response);
}

fn read_body(req: &mut tiny_http::Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    if req.as_reader().read_to_end(&mut body).is_ok() {
        Some(body)
    } else {
        None
    }
}

fn is_json(req: &tiny_http::Request) -> bool {
    req.headers().iter().any(|h| {
        h.field.equiv("Content-Type") && h.value.as_str().starts_with("application/json")
    })
}

fn handle_discovery(state: &AppState, mut req: tiny_http::Request) {
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 500, "read error");
        return;
    };
    let request: DiscoveryRequest = if body.is_empty() {
        DiscoveryRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                respond_err(req, 400, &format!("invalid discovery request: {e}"));
                return;
            }
        }
    };
    if !request.type_url.is_empty() && request.type_url != TYPED_EXTENSION_CONFIG_TYPE_URL {
        respond_err(req, 400, &format!("unsupported type_url '{}'", request.type_url));
        return;
    }

    let current = state.cache.version();
    if request.version_info == current.to_string()
        && state.cache.wait_for_change(current, state.poll_timeout) == current
    {
        let _ = req.respond(Response::empty(304));
        return;
    }

    let snapshot = state.cache.snapshot(&request.resource_names);
    let mut resources = Vec::with_capacity(snapshot.resources.len());
    for published in &snapshot.resources {
        match Any::pack(TYPED_EXTENSION_CONFIG_TYPE_URL, &published.resource) {
            Ok(any) => resources.push(any),
            Err(e) => {
                error!("failed to pack {}: {e}", published.name);
                respond_err(req, 500, "serialization error");
                return;
            }
        }
    }
    debug!(
        "discovery response version {} with {} resource(s)",
        snapshot.version,
        resources.len()
    );
    respond_json(
        req,
        200,
        &DiscoveryResponse {
            version_info: snapshot.version.to_string(),
            resources,
            type_url: TYPED_EXTENSION_CONFIG_TYPE_URL.to_owned(),
            nonce: snapshot.version.to_string(),
        },
    );
}

fn enqueue(state: &AppState, req: tiny_http::Request, notification: Notification, id: &NamespacedName) {
    if state.notifications.send(notification).is_ok() {
        respond_json(req, 202, &serde_json::json!({ "queued": id.to_string() }));
    } else {
        error!("reconciler is not running; dropping notification for {id}");
        respond_err(req, 503, "reconciler is not running");
    }
}

fn handle_apply(state: &AppState, mut req: tiny_http::Request) {
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 500, "read error");
        return;
    };
    let parsed = if is_json(&req) {
        parse_resource_json(&body)
    } else {
        match std::str::from_utf8(&body) {
            Ok(text) => parse_resource_str(text),
            Err(_) => {
                respond_err(req, 400, "resource must be UTF-8");
                return;
            }
        }
    };
    match parsed {
        Ok(resource) => {
            let id = resource.identity();
            info!("PUT /extensions: {id}");
            enqueue(state, req, Notification::Apply(resource), &id);
        }
        Err(e) => {
            warn!("PUT /extensions rejected: {e}");
            respond_err(req, 400, &e.to_string());
        }
    }
}

fn handle_delete(state: &AppState, req: tiny_http::Request, id: &str) {
    match id.parse::<NamespacedName>() {
        Ok(id) => {
            info!("DELETE /extensions/{id}");
            enqueue(state, req, Notification::Delete(id.clone()), &id);
        }
        Err(e) => respond_err(req, 400, &e.to_string()),
    }
}

#[derive(Serialize)]
struct ResourceSummary<'a> {
    name: &'a str,
    version: &'a str,
    published_at: &'a str,
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(state: &AppState, req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    match (&method, url.as_str()) {
        (Method::Post, DISCOVERY_PATH) => handle_discovery(state, req),
        (Method::Put, "/extensions") => handle_apply(state, req),
        (Method::Delete, path) if path.starts_with("/extensions/") => {
            handle_delete(state, req, &path["/extensions/".len()..]);
        }
        (Method::Get, "/resources") => {
            let snapshot = state.cache.snapshot(&[]);
            let summaries: Vec<ResourceSummary<'_>> = snapshot
                .resources
                .iter()
                .map(|r| ResourceSummary {
                    name: &r.name,
                    version: &r.version,
                    published_at: &r.published_at,
                })
                .collect();
            respond_json(
                req,
                200,
                &serde_json::json!({ "version": snapshot.version, "resources": summaries }),
            );
        }
        (Method::Get, path) if path.starts_with("/resources/") => {
            match state.cache.get(&path["/resources/".len()..]) {
                Some(published) => respond_json(req, 200, &published),
                None => respond_err(req, 404, "not found"),
            }
        }
        (Method::Get, "/health") => respond_json(
            req,
            200,
            &serde_json::json!({
                "status": "ok",
                "version": state.cache.version(),
                "resources": state.cache.len(),
            }),
        ),
        (_, DISCOVERY_PATH | "/extensions" | "/resources" | "/health") => {
            respond_err(req, 405, "method not allowed");
        }
        _ => respond_err(req, 404, "not found"),
    }
}

/// Accept requests until the server is unblocked. Each request runs on its
/// own thread so long-polls do not stall other callers.
pub fn serve(server: &Server, state: &Arc<AppState>) {
    for request in server.incoming_requests() {
        let state = Arc::clone(state);
        std::thread::spawn(move || handle_request(&state, request));
    }
}

/// A running bridge: HTTP server, reconciler worker, and shared state.
pub struct Bridge {
    pub server: Arc<Server>,
    pub state: Arc<AppState>,
    pub reconciler: ReconcilerHandle,
    pub cancel: CancelToken,
}

impl Bridge {
    /// Build providers, spawn the reconciler, and bind the listen address.
    pub fn start(config: &ServerConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, ServerError> {
        let providers = config.providers.build()?;
        let cache = Arc::new(ResourceCache::new());
        let handler = EventHandler::new(
            providers,
            store,
            Arc::clone(&cache) as Arc<dyn ResourcePublisher>,
        );
        let cancel = CancelToken::new();
        let server = Server::http(config.listen.as_str()).map_err(|e| ServerError::Bind {
            addr: config.listen.clone(),
            reason: e.to_string(),
        })?;

        let reconciler = Reconciler::new(
            handler,
            ReconcilerConfig {
                namespace: config.namespace.clone(),
                requeue_interval: config.requeue_interval(),
            },
            cancel.clone(),
        )
        .spawn();
        let state = Arc::new(AppState {
            cache,
            notifications: reconciler.sender(),
            poll_timeout: config.poll_timeout(),
        });
        Ok(Self {
            server: Arc::new(server),
            state,
            reconciler,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    /// Block serving requests until [`Server::unblock`] is called.
    pub fn serve(&self) {
        serve(&self.server, &self.state);
    }

    /// Cancel in-flight reconciliation and stop the worker.
    pub fn shutdown(self) {
        self.cancel.cancel();
        self.server.unblock();
        self.reconciler.shutdown();
    }
}

/// A test helper that starts a bridge on a random port in a background thread.
///
/// The server listens on `127.0.0.1:{port}`. Drop the `TestServer` to stop
/// it.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub cache: Arc<ResourceCache>,
    bridge: Option<Bridge>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    /// Start with `config`, overriding its listen address.
    pub fn start(mut config: ServerConfig, store: Arc<dyn KeyValueStore>) -> Self {
        config.listen = "127.0.0.1:0".to_owned();
        let bridge = Bridge::start(&config, store).expect("failed to start test bridge");
        let port = bridge.local_addr().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let server = Arc::clone(&bridge.server);
        let state = Arc::clone(&bridge.state);
        let handle = std::thread::spawn(move || serve(&server, &state));

        Self {
            url,
            port,
            cache: Arc::clone(&bridge.state.cache),
            bridge: Some(bridge),
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
