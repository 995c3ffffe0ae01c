use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use wasmxds_core::Notification;
use wasmxds_provider::S3Config;
use wasmxds_schema::parse_resource_file;
use wasmxds_server::{Bridge, ServerConfig, DISCOVERY_PATH};

#[derive(Parser)]
#[command(
    name = "wasmxds",
    version,
    about = "Serve WebAssembly HTTP filters to proxies as extension configs"
)]
struct Cli {
    /// Path to wasmxds.toml.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file).
    #[arg(long)]
    listen: Option<String>,

    /// Only reconcile resources in this namespace.
    #[arg(long, short = 'n')]
    namespace: Option<String>,

    /// Root of a directory-backed config-map/secret store.
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Skip TLS certificate verification for https:// images.
    #[arg(long)]
    insecure_https: bool,

    /// Serve the ECR registries of the current AWS account.
    #[arg(long)]
    ecr: bool,

    /// Enable the S3 provider against this endpoint.
    #[arg(long)]
    s3_endpoint: Option<String>,

    /// Extension resource files to apply at startup.
    #[arg(long = "apply", value_name = "FILE")]
    apply: Vec<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short = 'v', default_value_t = false)]
    verbose: bool,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig, wasmxds_server::ServerError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(listen) = &self.listen {
            config.listen.clone_from(listen);
        }
        if self.namespace.is_some() {
            config.namespace.clone_from(&self.namespace);
        }
        if self.store_dir.is_some() {
            config.store_dir.clone_from(&self.store_dir);
        }
        if self.insecure_https {
            config.providers.https.insecure = true;
        }
        if self.ecr {
            config.providers.ecr.enabled = true;
        }
        if let Some(endpoint) = &self.s3_endpoint {
            let s3 = config.providers.s3.get_or_insert_with(S3Config::default);
            s3.endpoint = Some(endpoint.clone());
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    let config = match cli.server_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let bridge = match Bridge::start(&config, config.key_value_store()) {
        Ok(bridge) => bridge,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    info!("listening on {} ({DISCOVERY_PATH})", config.listen);
    if let Some(namespace) = &config.namespace {
        info!("watching namespace {namespace}");
    }

    for path in &cli.apply {
        match parse_resource_file(path) {
            Ok(resource) => {
                info!("applying {} from {}", resource.identity(), path.display());
                if !bridge.reconciler.send(Notification::Apply(resource)) {
                    error!("reconciler stopped before startup resources were applied");
                    bridge.shutdown();
                    return ExitCode::FAILURE;
                }
            }
            Err(e) => warn!("skipping {}: {e}", path.display()),
        }
    }

    let server = Arc::clone(&bridge.server);
    let cancel = bridge.cancel.clone();
    let requested = AtomicBool::new(false);
    if let Err(e) = ctrlc::set_handler(move || {
        if requested.swap(true, Ordering::SeqCst) {
            std::process::exit(1);
        }
        eprintln!("\nshutdown requested, finishing current operation...");
        cancel.cancel();
        server.unblock();
    }) {
        warn!("failed to install signal handler: {e}");
    }

    bridge.serve();
    info!("shutting down");
    bridge.shutdown();
    ExitCode::SUCCESS
}
