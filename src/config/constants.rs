// Project-wide constants
//
// Centralised here so intervals and other magic values have one source of
// truth. Import via `use crate::config::constants::*;`.

/// Directory under $HOME holding config, identity, inbox and PID file.
pub const DATA_DIR_NAME: &str = ".agentlink";

/// Config file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Prefix for environment overrides (`AGENTLINK_BUS__BASE_URL`, ...).
pub const ENV_PREFIX: &str = "AGENTLINK";

pub const DEFAULT_BUS_URL: &str = "http://127.0.0.1:8787";
pub const DEFAULT_STREAM_PATH: &str = "/events";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 5_000;

pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_MULTIPLIER: u32 = 2;

/// Silence on the stream after which a liveness probe is issued.
pub const DEFAULT_KEEPALIVE_IDLE_MS: u64 = 15_000;
pub const DEFAULT_KEEPALIVE_CHECK_MS: u64 = 1_000;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_HANDLER_TIMEOUT_SECS: u64 = 300;

/// Default bind address for the local status server (localhost only).
pub const DEFAULT_STATUS_ADDR: &str = "127.0.0.1:7411";
