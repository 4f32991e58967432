use std::path::PathBuf;
use std::sync::Arc;

use session_engine::{
    resolve_server_paths, CatalogError, ConfigError, SceneGroupCatalog, SessionConfig,
    StartupError,
};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

const BOTS_ENV_VAR: &str = "SESSION_BOTS";
const MAP_ENV_VAR: &str = "SESSION_MAP";
const MAX_TICKS_ENV_VAR: &str = "SESSION_MAX_TICKS";
const DEFAULT_MAP: &str = "MapA";

#[derive(Debug, Error)]
pub(crate) enum BootstrapError {
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

pub(crate) struct ServerWiring {
    pub(crate) config: SessionConfig,
    pub(crate) catalog: Arc<SceneGroupCatalog>,
    pub(crate) map: String,
    pub(crate) bots: Vec<String>,
    pub(crate) max_ticks: Option<u64>,
}

pub(crate) fn build_server() -> Result<ServerWiring, BootstrapError> {
    init_tracing();
    info!("=== Session Server Startup ===");

    let config = SessionConfig::from_env()?;
    let catalog_path = match &config.catalog_path {
        Some(path) => path.clone(),
        None => resolve_server_paths()?.default_catalog,
    };
    let catalog = load_catalog(catalog_path)?;

    let map = std::env::var(MAP_ENV_VAR)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .unwrap_or_else(|| DEFAULT_MAP.to_string());
    let bots = parse_list(std::env::var(BOTS_ENV_VAR).ok().as_deref());
    let max_ticks = std::env::var(MAX_TICKS_ENV_VAR)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok());

    info!(
        tick_rate_hz = config.tick_rate_hz,
        channels = config.channel_count,
        strict = config.strict_mode,
        map = map.as_str(),
        bots = bots.len(),
        "server_configured"
    );

    Ok(ServerWiring {
        config,
        catalog,
        map,
        bots,
        max_ticks,
    })
}

fn load_catalog(path: PathBuf) -> Result<Arc<SceneGroupCatalog>, CatalogError> {
    let catalog = SceneGroupCatalog::load_json(&path)?;
    info!(
        path = %path.display(),
        groups = catalog.len(),
        fingerprint = catalog.fingerprint(),
        "catalog_loaded"
    );
    Ok(Arc::new(catalog))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

fn parse_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>()
    })
    .unwrap_or_default()
}
