use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// mDNS service type every team advertises under.
pub const SERVICE_TYPE: &str = "_lanteam._tcp.local.";
pub const DEFAULT_PORT: u16 = 19960;
pub const PROTOCOL_VERSION: &str = "1.0.0";

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
pub const RECONNECT_MIN: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const SUPERVISOR_TICK: Duration = Duration::from_secs(1);
pub const SYNC_AFTER_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// 512 KiB
pub const MAX_FRAME_SIZE: usize = 512 * 1024;
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Node settings, merged from defaults, `lanteam.toml` and `LANTEAM_*` env vars.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub bind: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub reconnect_min_secs: u64,
    pub reconnect_max_secs: u64,
    pub discovery_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            heartbeat_interval_secs: HEARTBEAT_INTERVAL.as_secs(),
            heartbeat_timeout_secs: HEARTBEAT_TIMEOUT.as_secs(),
            reconnect_min_secs: RECONNECT_MIN.as_secs(),
            reconnect_max_secs: RECONNECT_MAX.as_secs(),
            discovery_timeout_secs: DISCOVERY_TIMEOUT.as_secs(),
            sync_interval_secs: 300,
            request_timeout_secs: 10,
            download_timeout_secs: 300,
        }
    }
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".lanteam")
}

impl NodeConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from("lanteam.toml")
    }

    pub fn load_from(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        Figment::from(Serialized::defaults(NodeConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LANTEAM_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            reconnect_min: Duration::from_secs(self.reconnect_min_secs),
            reconnect_max: Duration::from_secs(self.reconnect_max_secs),
            ..TransportConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

/// Timings and limits shared by both ends of a team connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub supervisor_tick: Duration,
    pub max_frame_size: usize,
    pub queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            reconnect_min: RECONNECT_MIN,
            reconnect_max: RECONNECT_MAX,
            supervisor_tick: SUPERVISOR_TICK,
            max_frame_size: MAX_FRAME_SIZE,
            queue_capacity: SEND_QUEUE_CAPACITY,
        }
    }
}
