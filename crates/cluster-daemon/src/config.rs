//! Configuration loading and management

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use cluster_core::auth::HmacConf;
use cluster_core::coordinator::JoinPolicy;
use cluster_core::discovery::{DEFAULT_DISCOVERY_PORT, MULTICAST_GROUP};
use cluster_core::service::ServiceType;
use cluster_core::session::{DEFAULT_SESSION_TIMEOUT, MAX_SESSION_TIMEOUT};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "config.json";

/// Main configuration for the cluster daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Name of this machine within the cluster (defaults to the hostname)
    #[serde(default)]
    pub name: String,

    /// Address other daemons reach our public listener on
    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Management endpoint of every subsystem running on this machine
    #[serde(default)]
    pub services: BTreeMap<ServiceType, String>,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub join: JoinConfig,

    /// Argon2 cost of the pairing HMAC
    #[serde(default)]
    pub hmac: HmacConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Listener for other daemons
    #[serde(default = "default_public")]
    pub public: String,

    /// Loopback listener for the operator
    #[serde(default = "default_control")]
    pub control: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            public: default_public(),
            control: default_control(),
        }
    }
}

fn default_public() -> String {
    "0.0.0.0:9443".to_string()
}

fn default_control() -> String {
    "127.0.0.1:9444".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port used for lookups and replies
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Interface address used when a session does not name one
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,

    /// Multicast group lookups are sent to
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            interface: default_interface(),
            group: default_group(),
        }
    }
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_group() -> Ipv4Addr {
    MULTICAST_GROUP
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime in seconds when the client does not ask for one
    #[serde(default = "default_session_timeout")]
    pub default_timeout_secs: u64,

    /// Longest session lifetime a client may ask for
    #[serde(default = "default_max_session_timeout")]
    pub max_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_session_timeout(),
            max_timeout_secs: default_max_session_timeout(),
        }
    }
}

impl SessionConfig {
    /// Resolve a requested lifetime. Zero means the default.
    pub fn timeout(&self, requested_secs: u64) -> Option<Duration> {
        match requested_secs {
            0 => Some(Duration::from_secs(self.default_timeout_secs)),
            secs if secs <= self.max_timeout_secs => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }
}

fn default_session_timeout() -> u64 {
    DEFAULT_SESSION_TIMEOUT.as_secs()
}

fn default_max_session_timeout() -> u64 {
    MAX_SESSION_TIMEOUT.as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Peers joined before the rest wait for the cluster to settle
    #[serde(default = "default_threshold")]
    pub threshold: usize,

    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    /// Deadline for each batch of peers to report back
    #[serde(default = "default_join_timeout")]
    pub timeout_secs: u64,
}

impl Default for JoinConfig {
    fn default() -> Self {
        let policy = JoinPolicy::default();
        Self {
            threshold: policy.threshold,
            settle_delay_secs: policy.settle_delay.as_secs(),
            timeout_secs: policy.timeout.as_secs(),
        }
    }
}

impl JoinConfig {
    pub fn policy(&self) -> JoinPolicy {
        JoinPolicy {
            threshold: self.threshold,
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn default_threshold() -> usize {
    JoinPolicy::default().threshold
}

fn default_settle_delay() -> u64 {
    JoinPolicy::default().settle_delay.as_secs()
}

fn default_join_timeout() -> u64 {
    JoinPolicy::default().timeout.as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmacConfig {
    #[serde(default = "default_memory_kb")]
    pub memory_kb: u32,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

impl Default for HmacConfig {
    fn default() -> Self {
        Self {
            memory_kb: default_memory_kb(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

impl HmacConfig {
    pub fn conf(&self) -> HmacConf {
        HmacConf::default().with_params(self.memory_kb, self.iterations, self.parallelism)
    }
}

fn default_memory_kb() -> u32 {
    HmacConf::default().memory_kb
}

fn default_iterations() -> u32 {
    HmacConf::default().iterations
}

fn default_parallelism() -> u32 {
    HmacConf::default().parallelism
}

impl Config {
    /// Load configuration from the config directory
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join(CONFIG_FILE);

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {CONFIG_FILE}"))?;
            tracing::info!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_file);
            let config = Config::default();

            std::fs::create_dir_all(config_dir)
                .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

            // Write default config for reference
            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    /// Name of this machine, falling back to the hostname.
    pub fn member_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }

        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
            })
            .unwrap_or_else(|| "localhost".to_string())
    }
}
