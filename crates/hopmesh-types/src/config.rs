//! Node configuration.
//!
//! Every section carries `#[serde(default)]` so a partial TOML file only
//! overrides the keys it names. Defaults reproduce the behaviour of a node on
//! the reference overlay: degree bounds 3..=8, 48 hops, a 30s health tick.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Group id used when neither the config file nor the CLI provide one.
pub const DEFAULT_GROUP_ID: &str = "A5_1";

/// Top-level configuration for one overlay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's group id.
    pub group_id: String,
    /// TCP port to listen on.
    pub listen_port: u16,
    /// Address advertised to peers in SERVERS. Detected when unset.
    pub advertise_ip: Option<String>,
    /// Activity log path. Defaults to `<group_id>_server.log`.
    pub log_file: Option<PathBuf>,
    /// Seed peers (`ip:port`) connected at boot.
    pub seeds: Vec<String>,
    /// Run a full discovery scan at boot.
    pub scan_on_start: bool,
    /// Peer discovery settings.
    pub discovery: DiscoveryConfig,
    /// Health monitor schedule.
    pub health: HealthConfig,
    /// Routing policy.
    pub routing: RoutingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            group_id: DEFAULT_GROUP_ID.to_string(),
            listen_port: 4000,
            advertise_ip: None,
            log_file: None,
            seeds: Vec::new(),
            scan_on_start: false,
            discovery: DiscoveryConfig::default(),
            health: HealthConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Activity log path, falling back to `<group_id>_server.log`.
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}_server.log", self.group_id)))
    }
}

/// Discovery and degree settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Well-known host scanned when gossip yields too few peers.
    pub rendezvous_host: String,
    /// First port of the active scan range (inclusive).
    pub scan_start_port: u16,
    /// Last port of the active scan range (inclusive).
    pub scan_end_port: u16,
    /// Ports on the rendezvous host tried as a last resort.
    pub fallback_ports: Vec<u16>,
    /// Below this many connections the node actively scans.
    pub min_degree: usize,
    /// Hard cap on simultaneous peer connections.
    pub max_degree: usize,
    /// Connect-probe timeout during a range scan (ms).
    pub probe_timeout_ms: u64,
    /// Connect-probe timeout for fallback ports (ms).
    pub fallback_probe_timeout_ms: u64,
    /// Pause between successive connection attempts (ms).
    pub connect_pacing_ms: u64,
    /// Bound on each handshake read (secs).
    pub handshake_timeout_secs: u64,
    /// Minimum time between reconnect attempts to the same known peer (secs).
    pub helo_retry_cooldown_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rendezvous_host: "130.208.246.98".to_string(),
            scan_start_port: 4000,
            scan_end_port: 4200,
            fallback_ports: vec![5001, 5002, 5003],
            min_degree: 3,
            max_degree: 8,
            probe_timeout_ms: 200,
            fallback_probe_timeout_ms: 500,
            connect_pacing_ms: 2000,
            handshake_timeout_secs: 10,
            helo_retry_cooldown_secs: 60,
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn fallback_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_probe_timeout_ms)
    }

    pub fn connect_pacing(&self) -> Duration {
        Duration::from_millis(self.connect_pacing_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn helo_retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.helo_retry_cooldown_secs)
    }
}

/// Health monitor schedule, all values in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Base tick of the monitor loop.
    pub tick_secs: u64,
    /// KEEPALIVE broadcast interval.
    pub keepalive_secs: u64,
    /// GETMSGS broadcast interval.
    pub getmsgs_secs: u64,
    /// STATUSREQ broadcast interval.
    pub statusreq_secs: u64,
    /// Peers silent for longer than this are evicted.
    pub stale_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            keepalive_secs: 60,
            getmsgs_secs: 90,
            statusreq_secs: 180,
            stale_secs: 300,
        }
    }
}

impl HealthConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn getmsgs(&self) -> Duration {
        Duration::from_secs(self.getmsgs_secs)
    }

    pub fn statusreq(&self) -> Duration {
        Duration::from_secs(self.statusreq_secs)
    }

    pub fn stale(&self) -> Duration {
        Duration::from_secs(self.stale_secs)
    }
}

/// Routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Messages that have travelled this many hops are queued where they land.
    pub max_hops: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { max_hops: 48 }
    }
}
