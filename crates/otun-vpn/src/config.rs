//! Tunnel Configuration
//!
//! Static settings for the orchestrator and its helper daemons, plus the
//! small persisted state file that survives restarts.
//!
//! # Addressing
//!
//! ```text
//! gateway      192.168.200.1/32   (interface address, DNS forwarder bind)
//! virtual ip   192.168.200.2/24   (packet forwarder's netif address)
//! dummy dns    1.1.1.1            (intercepted by the packet forwarder)
//! ```

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Interface MTU
pub const DEFAULT_MTU: u16 = 1500;

/// Tor's DNS port when the host has not told us otherwise
pub const DEFAULT_TOR_DNS_PORT: u16 = 5400;

/// Port the DNS forwarder listens on (on the gateway address)
pub const DEFAULT_DNS_FORWARDER_PORT: u16 = 8091;

/// Delay before rebuilding an interface that was just torn down
pub const DEFAULT_RESTART_GRACE: Duration = Duration::from_secs(3);

const DNS_CONFIG_FILE: &str = "pdnsd.conf";
const DNS_PID_FILE: &str = "pdnsd.pid";
const DNS_CACHE_FILE: &str = "pdnsd.cache";
const DNS_OUTPUT_FILE: &str = "pdnsd.out";
const STATE_FILE: &str = "state.toml";

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    /// Private directory for generated config, pid and cache files
    pub working_dir: PathBuf,
    /// DNS forwarder daemon executable (pdnsd)
    pub dns_forwarder_path: PathBuf,
    /// Packet forwarder executable (tun2socks)
    pub packet_forwarder_path: PathBuf,
    /// Interface session name
    pub session_name: String,
    /// Interface MTU
    pub mtu: u16,
    /// Address assigned to the interface (/32)
    pub gateway: Ipv4Addr,
    /// Address handed to the packet forwarder
    pub virtual_ip: Ipv4Addr,
    /// Netmask handed to the packet forwarder
    pub netmask: Ipv4Addr,
    /// DNS server advertised on the interface, never actually queried
    pub dummy_dns: Ipv4Addr,
    /// Host of the anonymizing client's SOCKS and DNS ports
    pub upstream_host: Ipv4Addr,
    /// Upstream DNS port used until the host reports one
    pub default_dns_port: u16,
    /// Local DNS forwarder port on the gateway address
    pub dns_forwarder_port: u16,
    /// Pause before rebuilding a torn-down interface (milliseconds)
    pub restart_grace_ms: u64,
    /// Package id of this process; never routed into the tunnel
    pub own_package: String,
    /// Whether the platform can exclude applications from the VPN natively
    pub native_app_exclusion: bool,
    /// Lowest port the bypass proxy may pick
    pub bypass_port_min: u16,
    /// Highest port the bypass proxy may pick
    pub bypass_port_max: u16,
    /// Concurrent relays the bypass proxy serves before new clients queue
    pub bypass_max_connections: usize,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/var/lib/otun"),
            dns_forwarder_path: PathBuf::from("/usr/sbin/pdnsd"),
            packet_forwarder_path: PathBuf::from("/usr/bin/tun2socks"),
            session_name: "OrbotVPN".to_string(),
            mtu: DEFAULT_MTU,
            gateway: Ipv4Addr::new(192, 168, 200, 1),
            virtual_ip: Ipv4Addr::new(192, 168, 200, 2),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dummy_dns: Ipv4Addr::new(1, 1, 1, 1),
            upstream_host: Ipv4Addr::LOCALHOST,
            default_dns_port: DEFAULT_TOR_DNS_PORT,
            dns_forwarder_port: DEFAULT_DNS_FORWARDER_PORT,
            restart_grace_ms: DEFAULT_RESTART_GRACE.as_millis() as u64,
            own_package: "org.torproject.android".to_string(),
            native_app_exclusion: true,
            bypass_port_min: 10000,
            bypass_port_max: 10999,
            bypass_max_connections: 64,
        }
    }
}

impl VpnConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu == 0 {
            return Err(ConfigError::InvalidMtu);
        }
        if self.dns_forwarder_port == 0 {
            return Err(ConfigError::InvalidPort("dns_forwarder_port"));
        }
        if self.default_dns_port == 0 {
            return Err(ConfigError::InvalidPort("default_dns_port"));
        }
        if self.bypass_port_min == 0 || self.bypass_port_min > self.bypass_port_max {
            return Err(ConfigError::InvalidPortRange {
                min: self.bypass_port_min,
                max: self.bypass_port_max,
            });
        }
        if self.bypass_max_connections == 0 {
            return Err(ConfigError::NoConnections);
        }
        if self.session_name.is_empty() {
            return Err(ConfigError::EmptySessionName);
        }
        Ok(())
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    /// `host:port` of the anonymizing client's SOCKS listener
    pub fn socks_addr(&self, socks_port: u16) -> String {
        format!("{}:{}", self.upstream_host, socks_port)
    }

    /// `host:port` of the local DNS forwarder, as seen through the tunnel
    pub fn local_dns_addr(&self) -> String {
        format!("{}:{}", self.gateway, self.dns_forwarder_port)
    }

    pub fn dns_config_path(&self) -> PathBuf {
        self.working_dir.join(DNS_CONFIG_FILE)
    }

    pub fn dns_pid_path(&self) -> PathBuf {
        self.working_dir.join(DNS_PID_FILE)
    }

    pub fn dns_cache_path(&self) -> PathBuf {
        self.working_dir.join(DNS_CACHE_FILE)
    }

    /// Combined stdout and stderr of the last DNS forwarder launch
    pub fn dns_output_path(&self) -> PathBuf {
        self.working_dir.join(DNS_OUTPUT_FILE)
    }

    pub fn state_path(&self) -> PathBuf {
        self.working_dir.join(STATE_FILE)
    }
}

/// Validate a port number received over the command channel.
///
/// The host uses `-1` for "unknown"; anything outside 1..=65535 is rejected.
pub fn port_from_wire(value: i32) -> Option<u16> {
    u16::try_from(value).ok().filter(|port| *port != 0)
}

/// State written back to disk by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Port chosen by the bypass proxy the first time it ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_proxy_port: Option<u16>,
}

/// TOML-backed store for [`PersistedState`]
#[derive(Debug, Clone)]
pub struct StateStore {
    path: Option<PathBuf>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()) }
    }

    /// A store that never touches disk
    pub fn ephemeral() -> Self {
        Self { path: None }
    }

    /// Read the persisted state; a missing or unreadable file yields defaults.
    pub fn load(&self) -> PersistedState {
        let Some(path) = &self.path else {
            return PersistedState::default();
        };

        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring corrupt state file {}: {}", path.display(), e);
                PersistedState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => {
                warn!("Failed to read state file {}: {}", path.display(), e);
                PersistedState::default()
            }
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let content = toml::to_string_pretty(state)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        debug!("Persisted state to {}", path.display());
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("MTU must be non-zero")]
    InvalidMtu,

    #[error("Invalid port: {0}")]
    InvalidPort(&'static str),

    #[error("Invalid bypass port range {min}-{max}")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("bypass_max_connections must be non-zero")]
    NoConnections,

    #[error("Session name must not be empty")]
    EmptySessionName,
}
