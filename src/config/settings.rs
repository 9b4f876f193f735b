// Configuration structs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::constants::*;

/// Bus connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Base URL of the bus REST API
    pub base_url: String,
    /// Project credential sent as a bearer token
    pub api_key: String,
    /// Path of the push event stream, relative to base_url
    pub stream_path: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BUS_URL.to_string(),
            api_key: String::new(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_DISCOVERY_INTERVAL_MS,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Reconnect and keepalive tuning for the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_multiplier: u32,
    /// Silence after which a liveness probe is sent
    pub keepalive_idle_ms: u64,
    /// How often the silence check runs
    pub keepalive_check_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            reconnect_multiplier: DEFAULT_RECONNECT_MULTIPLIER,
            keepalive_idle_ms: DEFAULT_KEEPALIVE_IDLE_MS,
            keepalive_check_ms: DEFAULT_KEEPALIVE_CHECK_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

/// External handler invoked for routed messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Program to run; empty disables routing to a handler
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            timeout_secs: DEFAULT_HANDLER_TIMEOUT_SECS,
        }
    }
}

impl HandlerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn is_configured(&self) -> bool {
        !self.command.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for identity, inbox, sessions and PID file
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|home| home.join(DATA_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(DATA_DIR_NAME));
        Self { data_dir }
    }
}

impl PathsConfig {
    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir.join("inbox")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("daemon.pid")
    }

    pub fn machine_id_file(&self) -> PathBuf {
        self.data_dir.join("machine_id")
    }
}

/// Local status server (health + metrics).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: DEFAULT_STATUS_ADDR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusConfig,
    /// Overrides the persisted machine identity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    pub heartbeat: HeartbeatConfig,
    pub discovery: DiscoveryConfig,
    pub stream: StreamConfig,
    pub handler: HandlerConfig,
    pub paths: PathsConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Validate configuration and return helpful errors
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = self.bus.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!(
                "bus.base_url must start with http:// or https:// (got '{}')",
                self.bus.base_url
            );
        }
        if !self.bus.stream_path.starts_with('/') {
            anyhow::bail!("bus.stream_path must start with '/'");
        }
        if self.heartbeat.interval_ms == 0 {
            anyhow::bail!("heartbeat.interval_ms must be greater than zero");
        }
        if self.discovery.interval_ms == 0 {
            anyhow::bail!("discovery.interval_ms must be greater than zero");
        }
        let stream = &self.stream;
        if stream.reconnect_base_ms == 0 {
            anyhow::bail!("stream.reconnect_base_ms must be greater than zero");
        }
        if stream.reconnect_max_ms < stream.reconnect_base_ms {
            anyhow::bail!("stream.reconnect_max_ms must be >= stream.reconnect_base_ms");
        }
        if stream.reconnect_multiplier == 0 {
            anyhow::bail!("stream.reconnect_multiplier must be at least 1");
        }
        if stream.keepalive_idle_ms == 0 || stream.keepalive_check_ms == 0 {
            anyhow::bail!("stream keepalive intervals must be greater than zero");
        }
        Ok(())
    }

    /// Extra checks for running the daemon (a credential is required).
    pub fn validate_for_daemon(&self) -> anyhow::Result<()> {
        self.validate()?;
        if self.bus.api_key.trim().is_empty() {
            anyhow::bail!(
                "No bus credential configured.\n\n\
                 Set bus.api_key in ~/.agentlink/config.toml or export AGENTLINK_API_KEY"
            );
        }
        Ok(())
    }
}
