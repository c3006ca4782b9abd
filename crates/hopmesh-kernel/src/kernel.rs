//! HopmeshKernel — assembles and runs one overlay node.

use crate::error::{KernelError, KernelResult};
use crate::heartbeat::HealthMonitor;
use crate::router::Router;
use hopmesh_types::config::NodeConfig;
use hopmesh_types::error::{HopmeshError, HopmeshResult};
use hopmesh_wire::discovery::Discovery;
use hopmesh_wire::peer::{PeerConfig, PeerNode};
use hopmesh_wire::registry::{LocalPeer, PeerRegistry};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A booted node: listener running, no peers yet.
pub struct HopmeshKernel {
    config: NodeConfig,
    registry: PeerRegistry,
    node: Arc<PeerNode>,
    discovery: Arc<Discovery>,
    accept_task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl HopmeshKernel {
    /// Bind the listener and wire the router, discovery and registry together.
    pub async fn boot(config: NodeConfig) -> KernelResult<Self> {
        let ip = config.advertise_ip.clone().unwrap_or_else(detect_local_ip);
        let local = LocalPeer {
            group_id: config.group_id.clone(),
            ip,
            port: config.listen_port,
        };
        info!(
            group_id = %local.group_id,
            ip = %local.ip,
            port = local.port,
            "Booting node"
        );

        let registry = PeerRegistry::new(local, config.discovery.max_degree);
        let router = Arc::new(Router::new(registry.clone(), &config.routing));
        let peer_config = PeerConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], config.listen_port)),
            handshake_timeout: config.discovery.handshake_timeout(),
        };
        let (node, accept_task) = PeerNode::start(peer_config, registry.clone(), router)
            .await
            .map_err(|e| {
                KernelError::BootFailed(format!("cannot listen on port {}: {e}", config.listen_port))
            })?;
        let discovery = Arc::new(Discovery::new(
            Arc::clone(&node),
            config.discovery.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            node,
            discovery,
            accept_task,
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn node(&self) -> &Arc<PeerNode> {
        &self.node
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    /// Seeds first; then either a full scan (if requested) or, with nothing
    /// connected, the rendezvous host's first fallback port.
    pub async fn connect_initial_peers(&self) -> usize {
        let seeds = parse_seeds(&self.config.seeds);
        let mut connected = self.discovery.connect_seeds(&seeds).await;

        if self.config.scan_on_start {
            if let Some(report) = self.discovery.trigger_scan().await {
                connected += report.total();
            }
        } else if self.registry.connection_count() == 0 && self.discovery.connect_rendezvous().await {
            connected += 1;
        }

        info!(
            connected,
            total = self.registry.connection_count(),
            "Initial peer connections done"
        );
        connected
    }

    /// Spawn the health monitor, bound to this kernel's shutdown signal.
    pub fn start_health_monitor(&self) -> JoinHandle<()> {
        let monitor = HealthMonitor::new(
            self.registry.clone(),
            Arc::clone(&self.discovery),
            self.config.health.clone(),
        );
        monitor.spawn(self.shutdown_tx.subscribe())
    }

    /// Signal background tasks to stop.
    pub fn shutdown(&self) {
        info!("Initiating shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    /// Connect, start maintenance and serve until Ctrl-C or listener failure.
    pub async fn run(mut self) -> KernelResult<()> {
        self.connect_initial_peers().await;
        let health = self.start_health_monitor();
        info!("Ready - listening for connections");

        let result = tokio::select! {
            joined = &mut self.accept_task => {
                Err(KernelError::ListenerStopped(format!("{joined:?}")))
            }
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => {
                        info!("Ctrl-C received");
                        Ok(())
                    }
                    Err(e) => Err(HopmeshError::from(e).into()),
                }
            }
        };

        self.shutdown();
        self.accept_task.abort();
        let _ = health.await;
        result
    }
}

/// Parse an `ip:port` seed.
pub fn parse_seed(seed: &str) -> HopmeshResult<(String, u16)> {
    let (ip, port) = seed
        .rsplit_once(':')
        .ok_or_else(|| HopmeshError::InvalidInput(format!("seed '{seed}' is not ip:port")))?;
    if ip.is_empty() {
        return Err(HopmeshError::InvalidInput(format!("seed '{seed}' has no host")));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| HopmeshError::InvalidInput(format!("seed '{seed}' has a bad port")))?;
    Ok((ip.to_string(), port))
}

/// Parse all seeds, skipping (and logging) malformed ones.
pub fn parse_seeds(seeds: &[String]) -> Vec<(String, u16)> {
    seeds
        .iter()
        .filter_map(|seed| match parse_seed(seed) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(error = %e, "Ignoring seed");
                None
            }
        })
        .collect()
}

/// Address of the interface that routes to the internet, or loopback.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn detect_local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:53")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}
