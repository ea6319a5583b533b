//! Agent configuration

use anyhow::Result;
use attribution_lib::EngineConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Optional configuration file, any format the `config` crate detects
const CONFIG_FILE: &str = "/etc/storage-agent/config";

/// Keys holding comma separated lists when set through the environment
const LIST_KEYS: &[&str] = &[
    "allowed_roots",
    "mount_tables",
    "runtime_command",
    "du_command",
    "excluded_paths",
];

/// Agent configuration, from `AGENT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Seconds between attribution runs
    #[serde(default = "default_run_interval")]
    pub run_interval_secs: u64,

    #[serde(default = "default_measure_timeout")]
    pub measure_timeout_secs: u64,

    /// Zero disables result caching
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub skip_zero: bool,

    #[serde(default)]
    pub allowed_roots: Vec<PathBuf>,

    /// Host filesystem mount inside the agent container, e.g. `/host`
    #[serde(default)]
    pub host_root: Option<PathBuf>,

    #[serde(default = "default_kubelet_root")]
    pub kubelet_root: PathBuf,

    #[serde(default = "default_mount_tables")]
    pub mount_tables: Vec<PathBuf>,

    #[serde(default = "default_runtime_command")]
    pub runtime_command: Vec<String>,

    #[serde(default = "default_runtime_timeout")]
    pub runtime_timeout_secs: u64,

    #[serde(default = "default_du_command")]
    pub du_command: Vec<String>,

    /// Set when `du_command` enters the host mount namespace (`nsenter`)
    #[serde(default)]
    pub du_in_host_namespace: bool,

    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<PathBuf>,

    #[serde(default)]
    pub include_memory_backed: bool,

    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_run_interval() -> u64 {
    300
}

fn default_measure_timeout() -> u64 {
    EngineConfig::default().measure_timeout.as_secs()
}

fn default_cache_ttl() -> u64 {
    EngineConfig::default().cache_ttl.as_secs()
}

fn default_max_workers() -> usize {
    EngineConfig::default().max_workers
}

fn default_kubelet_root() -> PathBuf {
    EngineConfig::default().kubelet_root
}

fn default_mount_tables() -> Vec<PathBuf> {
    EngineConfig::default().mount_tables
}

fn default_runtime_command() -> Vec<String> {
    EngineConfig::default().runtime_command
}

fn default_runtime_timeout() -> u64 {
    EngineConfig::default().runtime_timeout.as_secs()
}

fn default_du_command() -> Vec<String> {
    EngineConfig::default().du_command
}

fn default_excluded_paths() -> Vec<PathBuf> {
    EngineConfig::default().excluded_paths
}

fn default_channel_buffer() -> usize {
    EngineConfig::default().channel_buffer
}

impl AgentConfig {
    /// Load configuration from the optional config file and the environment.
    /// Environment variables take precedence.
    pub fn load() -> Result<Self> {
        Self::from_builder(
            config::Config::builder()
                .add_source(config::File::with_name(CONFIG_FILE).required(false)),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        let environment = LIST_KEYS.iter().fold(
            config::Environment::with_prefix("AGENT")
                .try_parsing(true)
                .list_separator(","),
            |env, key| env.with_list_parse_key(key),
        );

        let config = builder.add_source(environment).build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn run_interval(&self) -> Duration {
        Duration::from_secs(self.run_interval_secs)
    }

    /// Engine settings derived from this configuration
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            measure_timeout: Duration::from_secs(self.measure_timeout_secs),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            max_workers: self.max_workers,
            skip_zero: self.skip_zero,
            allowed_roots: self.allowed_roots.clone(),
            host_root: self.host_root.clone(),
            kubelet_root: self.kubelet_root.clone(),
            mount_tables: self.mount_tables.clone(),
            runtime_command: self.runtime_command.clone(),
            runtime_timeout: Duration::from_secs(self.runtime_timeout_secs),
            du_command: self.du_command.clone(),
            du_in_host_namespace: self.du_in_host_namespace,
            excluded_paths: self.excluded_paths.clone(),
            include_memory_backed: self.include_memory_backed,
            channel_buffer: self.channel_buffer,
        }
    }
}
