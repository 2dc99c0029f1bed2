use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global platform configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Root directory for workspaces, uploads and the registry database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// HTTP listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Container engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Host port allocation
    #[serde(default)]
    pub ports: PortsConfig,

    /// Deploy pipeline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Subdomain reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Periodic stats sampling
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Default runtime limits for new services
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen address for both the platform API and proxied traffic
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Timeout for platform API requests in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long to wait for background tasks on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Docker endpoint (`unix:///path` or `tcp://host:port`). Auto-detected if unset.
    pub docker_host: Option<String>,

    /// Docker CLI used for image builds
    #[serde(default = "default_docker_cli")]
    pub docker_cli: String,

    /// Grace period before a stopping container is killed
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Grace period used when removing a container
    #[serde(default = "default_remove_grace")]
    pub remove_grace_secs: u64,

    /// Process-count ceiling for app containers
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    /// Process-count ceiling for VM containers
    #[serde(default = "default_vm_pids_limit")]
    pub vm_pids_limit: i64,

    /// Build-time resources relative to the service's runtime limits
    #[serde(default = "default_build_multiplier")]
    pub build_multiplier: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            docker_cli: default_docker_cli(),
            stop_grace_secs: default_stop_grace(),
            remove_grace_secs: default_remove_grace(),
            pids_limit: default_pids_limit(),
            vm_pids_limit: default_vm_pids_limit(),
            build_multiplier: default_build_multiplier(),
        }
    }
}

impl EngineConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn remove_grace(&self) -> Duration {
        Duration::from_secs(self.remove_grace_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    /// First candidate host port
    #[serde(default = "default_port_base")]
    pub base: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base: default_port_base(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Wait after start before inspecting the container
    #[serde(default = "default_health_grace")]
    pub health_grace_secs: u64,

    /// Maximum stored build log size in bytes
    #[serde(default = "default_build_log_limit")]
    pub build_log_limit: usize,

    /// Number of successful deployment images kept for rollback
    #[serde(default = "default_retained_images")]
    pub retained_images: usize,

    /// Node major version used by generated recipes
    #[serde(default = "default_node_version")]
    pub node_version: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            health_grace_secs: default_health_grace(),
            build_log_limit: default_build_log_limit(),
            retained_images: default_retained_images(),
            node_version: default_node_version(),
        }
    }
}

impl PipelineConfig {
    pub fn health_grace(&self) -> Duration {
        Duration::from_secs(self.health_grace_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Seed for the persisted `base_domain` setting
    pub base_domain: Option<String>,

    /// How long a base domain read stays cached
    #[serde(default = "default_domain_cache_ttl")]
    pub domain_cache_ttl_secs: u64,

    /// Maximum idle upstream connections per service port
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Timeout for a proxied request to produce response headers
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            base_domain: None,
            domain_cache_ttl_secs: default_domain_cache_ttl(),
            max_idle_per_host: default_max_idle_per_host(),
            idle_timeout_secs: default_idle_timeout(),
            upstream_timeout_secs: default_upstream_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,

    /// Metric rows older than this are pruned
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_alert_threshold")]
    pub alert_cpu_percent: f64,

    #[serde(default = "default_alert_threshold")]
    pub alert_memory_percent: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval(),
            retention_days: default_retention_days(),
            alert_cpu_percent: default_alert_threshold(),
            alert_memory_percent: default_alert_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// CPU fraction (1.0 = one core)
    #[serde(default = "default_cpu")]
    pub cpu: f64,

    /// Memory in bytes
    #[serde(default = "default_memory")]
    pub memory: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cpu: default_cpu(),
            memory: default_memory(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            ports: PortsConfig::default(),
            pipeline: PipelineConfig::default(),
            proxy: ProxyConfig::default(),
            metrics: MetricsConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Smallest memory limit Docker accepts
const MIN_MEMORY_BYTES: i64 = 6 * 1024 * 1024;

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    15
}

fn default_docker_cli() -> String {
    "docker".to_string()
}

fn default_stop_grace() -> u64 {
    10
}

fn default_remove_grace() -> u64 {
    5
}

fn default_pids_limit() -> i64 {
    256
}

fn default_vm_pids_limit() -> i64 {
    512
}

fn default_build_multiplier() -> f64 {
    5.0
}

fn default_port_base() -> u16 {
    4001
}

fn default_health_grace() -> u64 {
    3
}

fn default_build_log_limit() -> usize {
    256 * 1024
}

fn default_retained_images() -> usize {
    5
}

fn default_node_version() -> String {
    "20".to_string()
}

fn default_domain_cache_ttl() -> u64 {
    5
}

fn default_max_idle_per_host() -> usize {
    16
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_metrics_interval() -> u64 {
    30
}

fn default_retention_days() -> u32 {
    7
}

fn default_alert_threshold() -> f64 {
    90.0
}

fn default_cpu() -> f64 {
    0.25
}

fn default_memory() -> i64 {
    268_435_456
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("HOSTDECK_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(bind) = std::env::var("HOSTDECK_BIND") {
            self.server.bind = bind;
        }
        if self.engine.docker_host.is_none() {
            self.engine.docker_host = std::env::var("DOCKER_HOST").ok();
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.data_dir.as_os_str().is_empty() {
            errors.push("'data_dir' must not be empty".to_string());
        }
        if self.ports.base == 0 {
            errors.push("'ports.base' must be greater than 0".to_string());
        }
        if self.metrics.interval_secs == 0 {
            errors.push("'metrics.interval_secs' must be greater than 0".to_string());
        }
        if self.limits.cpu <= 0.0 {
            errors.push("'limits.cpu' must be greater than 0".to_string());
        }
        if self.limits.memory < MIN_MEMORY_BYTES {
            errors.push(format!(
                "'limits.memory' must be at least {} bytes",
                MIN_MEMORY_BYTES
            ));
        }
        if self.engine.build_multiplier < 1.0 {
            errors.push("'engine.build_multiplier' must be at least 1.0".to_string());
        }
        if let Some(domain) = &self.proxy.base_domain {
            if !is_valid_hostname(domain) {
                errors.push(format!("'proxy.base_domain' is not a valid hostname: {}", domain));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("hostdeck.db")
    }

    pub fn services_dir(&self) -> PathBuf {
        self.data_dir.join("services")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}

/// Hostname check shared by config validation and the domain setting endpoint
pub fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('.')
        && !host.ends_with('.')
        && !host.contains("..")
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}
