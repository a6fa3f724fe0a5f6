use serde::Deserialize;
use std::num::NonZeroUsize;
use std::path::Path;

/// A single named service: a path slug mapped to an upstream base URL.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Unique path segment identifying the service (e.g. `svc` in `/svc/api/x`)
    pub slug: String,

    /// Base URL of the upstream (scheme + host + optional path prefix)
    pub target: String,
}

/// Global configuration for the proxy, loaded once at process start.
///
/// Field names in the JSON file are camelCase (`serverPort`, `removeRouteSlug`, ...).
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Listening port shared by all workers (default: 0 = OS-assigned,
    /// only valid with a single worker)
    #[serde(default)]
    pub server_port: u16,

    /// Services routable by slug, in declaration order
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,

    /// Strip the matched slug from the forwarded path (default: true)
    #[serde(default = "default_remove_route_slug")]
    pub remove_route_slug: bool,

    /// Rewrite the upstream Host header to the target's host (default: false)
    #[serde(default)]
    pub change_origin: bool,

    /// Proxy WebSocket upgrade requests (default: false)
    #[serde(default, rename = "enableWS")]
    pub enable_ws: bool,

    /// Number of worker processes (default: available CPU cores)
    #[serde(default = "default_cluster_size")]
    pub cluster_size: usize,

    /// Replace a worker that exits (default: true)
    #[serde(default = "default_restart_workers")]
    pub restart_workers: bool,

    /// Any worker exit terminates the whole system (default: false)
    #[serde(default)]
    pub force_shutdown_on_worker_exit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 0,
            services: Vec::new(),
            remove_route_slug: default_remove_route_slug(),
            change_origin: false,
            enable_ws: false,
            cluster_size: default_cluster_size(),
            restart_workers: default_restart_workers(),
            force_shutdown_on_worker_exit: false,
        }
    }
}

fn default_remove_route_slug() -> bool {
    true
}

fn default_restart_workers() -> bool {
    true
}

fn default_cluster_size() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Invalid JSON in config file '{}': {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration. Runs before any socket is bound or worker
    /// is forked; every problem is reported in one pass.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (index, service) in self.services.iter().enumerate() {
            if service.slug.is_empty() {
                errors.push(format!("Service #{}: 'slug' must be non-empty", index));
            }
            if service.target.is_empty() {
                errors.push(format!("Service #{}: 'target' must be non-empty", index));
            } else if !service.target.starts_with("http://") {
                errors.push(format!(
                    "Service #{} ('{}'): 'target' must be an http:// URL",
                    index, service.slug
                ));
            }
        }

        if self.cluster_size == 0 {
            errors.push("'clusterSize' must be at least 1".to_string());
        }

        // An ephemeral port cannot be shared: each worker would get an
        // unrelated OS-assigned port.
        if self.server_port == 0 && self.cluster_size > 1 {
            errors.push("'serverPort' 0 (OS-assigned) requires 'clusterSize' 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
