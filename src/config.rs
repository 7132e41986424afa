//! Configuration for agentmesh paths and runtime limits.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (AGENTMESH_HOME, AGENTMESH_REGISTRY, AGENTMESH_EVENTS_DB)
//! 2. Config file (.agentmesh/config.yaml)
//! 3. Defaults (~/.agentmesh)
//!
//! Config file discovery:
//! - Searches current directory and parents for .agentmesh/config.yaml
//! - Paths in config file are relative to the config file's parent directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::orchestrator::ExecutionLimits;
use crate::core::router::RouterConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
    #[serde(default)]
    pub router: Option<RouterFileConfig>,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to config file)
    pub home: Option<String>,
    /// Agent/chain registry file (relative to config file)
    pub registry: Option<String>,
    /// Event log database (relative to config file)
    pub events_db: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterFileConfig {
    /// Base URL of the alternate orchestrator runtime
    pub secondary_url: Option<String>,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub probe_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Webhook endpoint for human-attention notifications
    pub endpoint: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to agentmesh home (engine state)
    pub home: PathBuf,
    /// Absolute path to the registry YAML
    pub registry: PathBuf,
    /// Absolute path to the event log database
    pub events_db: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Execution limits for the chain engine
    pub limits: ExecutionLimits,
    /// Router failover settings
    pub router: RouterConfig,
    /// Base URL of the alternate orchestrator, if configured
    pub secondary_url: Option<String>,
    /// Notification webhook, if configured
    pub notify_endpoint: Option<String>,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".agentmesh").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".agentmesh");

    // Check for config file
    let config_file = find_config_file();

    let (home, registry, events_db, limits, router, secondary_url, notify_endpoint) =
        if let Some(ref config_path) = config_file {
            let config = load_config_file(config_path)?;

            // Paths in the file are relative to the .agentmesh/ directory
            let mesh_dir = config_path.parent().unwrap_or(Path::new("."));

            let home = if let Ok(env_home) = std::env::var("AGENTMESH_HOME") {
                PathBuf::from(env_home)
            } else if let Some(ref home_path) = config.paths.home {
                resolve_path(mesh_dir, home_path)
            } else {
                default_home.clone()
            };

            let registry = if let Ok(env_registry) = std::env::var("AGENTMESH_REGISTRY") {
                PathBuf::from(env_registry)
            } else if let Some(ref registry_path) = config.paths.registry {
                resolve_path(mesh_dir, registry_path)
            } else {
                home.join("registry.yaml")
            };

            let events_db = if let Ok(env_db) = std::env::var("AGENTMESH_EVENTS_DB") {
                PathBuf::from(env_db)
            } else if let Some(ref db_path) = config.paths.events_db {
                resolve_path(mesh_dir, db_path)
            } else {
                home.join("events.db")
            };

            let limits = config.limits.unwrap_or_default();

            let defaults = RouterConfig::default();
            let (router, secondary_url) = match config.router {
                Some(r) => (
                    RouterConfig {
                        failure_threshold: r.failure_threshold.unwrap_or(defaults.failure_threshold),
                        success_threshold: r.success_threshold.unwrap_or(defaults.success_threshold),
                        probe_interval_seconds: r
                            .probe_interval_seconds
                            .unwrap_or(defaults.probe_interval_seconds),
                    },
                    r.secondary_url,
                ),
                None => (defaults, None),
            };

            let notify_endpoint = config.notify.and_then(|n| n.endpoint);

            (home, registry, events_db, limits, router, secondary_url, notify_endpoint)
        } else {
            // No config file - use env vars or defaults
            let home = std::env::var("AGENTMESH_HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_home.clone());

            let registry = std::env::var("AGENTMESH_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| home.join("registry.yaml"));

            let events_db = std::env::var("AGENTMESH_EVENTS_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| home.join("events.db"));

            (
                home,
                registry,
                events_db,
                ExecutionLimits::default(),
                RouterConfig::default(),
                None,
                None,
            )
        };

    Ok(ResolvedConfig {
        home,
        registry,
        events_db,
        config_file,
        limits,
        router,
        secondary_url,
        notify_endpoint,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
