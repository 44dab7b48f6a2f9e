//! Server startup: configuration loading, shared state, listener spawn.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use seam_core::directory::listener::run_listener;
use seam_core::{
    CachedSessionBroker, Directory, Executor, ExtensionRegistry, GatewayConfig,
    HttpSessionBroker, SessionBroker,
};

/// Shared per-process state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<GatewayConfig>,
    pub directory: Arc<Directory>,
    pub broker: Arc<dyn SessionBroker>,
    pub executor: Arc<Executor>,
    pub extensions: Arc<ExtensionRegistry>,
}

/// Load the gateway configuration.
///
/// An explicitly given path must exist; otherwise `SEAM_CONFIG`,
/// `seam.toml`, and `/etc/seam/seam.toml` are tried in order, falling back
/// to defaults when none is present.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig> {
    let candidates: Vec<PathBuf> = match path {
        Some(explicit) => {
            if !explicit.is_file() {
                bail!("configuration file {} not found", explicit.display());
            }
            vec![explicit.to_path_buf()]
        }
        None => {
            let mut candidates = Vec::new();
            if let Ok(env_path) = std::env::var("SEAM_CONFIG") {
                candidates.push(PathBuf::from(env_path));
            }
            candidates.push(PathBuf::from("seam.toml"));
            candidates.push(PathBuf::from("/etc/seam/seam.toml"));
            candidates
        }
    };

    for candidate in &candidates {
        if candidate.is_file() {
            let raw = fs::read_to_string(candidate)
                .with_context(|| format!("failed to read {}", candidate.display()))?;
            let config: GatewayConfig = toml::from_str(&raw)
                .with_context(|| format!("failed to parse {}", candidate.display()))?;
            info!(path = %candidate.display(), "loaded configuration");
            return Ok(config);
        }
    }

    warn!("no configuration file found, using defaults");
    Ok(GatewayConfig::default())
}

/// Build state, spawn the notification listeners, and serve.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let cfg = Arc::new(config);
    let directory = Arc::new(Directory::connect(&cfg.database_url).await?);
    let broker: Arc<dyn SessionBroker> = Arc::new(CachedSessionBroker::new(
        Arc::new(HttpSessionBroker::new(cfg.clone())),
        &cfg.cache,
    ));
    let executor = Arc::new(Executor::new(cfg.clone(), broker.clone()));
    let extensions = Arc::new(ExtensionRegistry::from_names(&cfg.extensions)?);

    for sp in &cfg.service_providers {
        if sp.messagebus.is_some() {
            tokio::spawn(run_listener(directory.clone(), sp.clone()));
        }
    }

    let state = AppState {
        cfg: cfg.clone(),
        directory,
        broker,
        executor,
        extensions,
    };

    let app = crate::api::router(state);
    let listener = TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.server.bind))?;
    info!(
        bind = %cfg.server.bind,
        providers = cfg.service_providers.len(),
        "seam gateway listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}

/// Create the directory schema and exit.
pub async fn db_sync(config: GatewayConfig) -> Result<()> {
    Directory::connect(&config.database_url).await?;
    info!(database_url = %config.database_url, "directory schema ready");
    Ok(())
}
