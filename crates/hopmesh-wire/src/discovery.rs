//! Discovery engine — seeds, known-peer retries, scans and fallbacks.

use crate::peer::PeerNode;
use crate::scanner::{is_port_open, scan_for_servers, select_neighbors};
use hopmesh_types::config::DiscoveryConfig;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How many connections each discovery stage produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub known: usize,
    pub scanned: usize,
    pub fallback: usize,
}

impl ScanReport {
    pub fn total(&self) -> usize {
        self.known + self.scanned + self.fallback
    }
}

/// Finds and connects to peers on behalf of a [`PeerNode`].
pub struct Discovery {
    node: Arc<PeerNode>,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(node: Arc<PeerNode>, config: DiscoveryConfig) -> Self {
        Self { node, config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Connections to the rendezvous host's fallback ports are trusted.
    pub fn is_trusted(&self, ip: &str, port: u16) -> bool {
        ip == self.config.rendezvous_host && self.config.fallback_ports.contains(&port)
    }

    async fn try_connect(&self, ip: &str, port: u16) -> bool {
        match self
            .node
            .connect_to_server(ip, port, self.is_trusted(ip, port))
            .await
        {
            Ok(peer) => {
                debug!(peer = %peer, "Discovery connected {}:{}", ip, port);
                true
            }
            Err(e) => {
                debug!("Connection to {}:{} failed: {}", ip, port, e);
                false
            }
        }
    }

    async fn pace(&self) {
        tokio::time::sleep(self.config.connect_pacing()).await;
    }

    /// Connect to command-line seeds in order, pacing between attempts.
    pub async fn connect_seeds(&self, seeds: &[(String, u16)]) -> usize {
        let mut connected = 0;
        for (i, (ip, port)) in seeds.iter().enumerate() {
            if self.node.registry().is_full() {
                break;
            }
            if i > 0 {
                self.pace().await;
            }
            if self.try_connect(ip, *port).await {
                connected += 1;
            } else {
                warn!("Seed {}:{} unreachable", ip, port);
            }
        }
        connected
    }

    /// Dial the first fallback port of the rendezvous host.
    pub async fn connect_rendezvous(&self) -> bool {
        let Some(&port) = self.config.fallback_ports.first() else {
            return false;
        };
        let host = self.config.rendezvous_host.clone();
        info!("Connecting to rendezvous {}:{}", host, port);
        self.try_connect(&host, port).await
    }

    /// Retry cached known peers not connected and not greeted recently.
    pub async fn try_known_peers(&self) -> usize {
        let registry = self.node.registry();
        let cooldown = self.config.helo_retry_cooldown();
        let mut connected = 0;

        for peer in registry.known_peers() {
            if registry.is_full() {
                break;
            }
            if registry.is_group_connected(&peer.group_id) {
                continue;
            }
            if !registry.should_attempt_helo(&peer.group_id, Instant::now(), cooldown) {
                debug!(peer = %peer.group_id, "Skipping known peer, greeted recently");
                continue;
            }
            if self.try_connect(&peer.ip, peer.port).await {
                connected += 1;
            }
            self.pace().await;
        }
        connected
    }

    /// Full discovery pass. Returns `None` when a scan is already running.
    ///
    /// Known peers come first; the rendezvous port range is scanned only
    /// while below the minimum degree, and the fallback ports are probed
    /// only if the scan still leaves the node below it.
    pub async fn trigger_scan(&self) -> Option<ScanReport> {
        let registry = self.node.registry();
        let Some(_guard) = registry.try_begin_scan() else {
            debug!("Discovery already in progress");
            return None;
        };

        let mut report = ScanReport {
            known: self.try_known_peers().await,
            ..Default::default()
        };

        if registry.connection_count() < self.config.min_degree {
            let host = self.config.rendezvous_host.clone();
            let found = scan_for_servers(
                &host,
                self.config.scan_start_port,
                self.config.scan_end_port,
                registry.local().port,
                self.config.probe_timeout(),
            )
            .await;

            // Every responsive port stays a candidate; capacity ends the loop.
            for port in select_neighbors(&found, registry.local().port, found.len()) {
                if registry.is_full() {
                    break;
                }
                if self.try_connect(&host, port).await {
                    report.scanned += 1;
                }
                self.pace().await;
            }
        }

        if registry.connection_count() < self.config.min_degree {
            report.fallback = self.probe_fallbacks().await;
        }

        info!(
            known = report.known,
            scanned = report.scanned,
            fallback = report.fallback,
            total = registry.connection_count(),
            "Discovery finished"
        );
        Some(report)
    }

    async fn probe_fallbacks(&self) -> usize {
        let registry = self.node.registry();
        let host = self.config.rendezvous_host.clone();
        let mut connected = 0;

        for &port in &self.config.fallback_ports {
            if registry.connection_count() >= self.config.min_degree {
                break;
            }
            if !is_port_open(&host, port, self.config.fallback_probe_timeout()).await {
                continue;
            }
            if self.try_connect(&host, port).await {
                connected += 1;
            }
            self.pace().await;
        }
        connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ClientCommand, Command, ServerEntry};
    use crate::link::PeerLink;
    use crate::peer::{PeerConfig, PeerHandle};
    use crate::registry::{LocalPeer, PeerRegistry};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Binder {
        registry: PeerRegistry,
    }

    #[async_trait]
    impl PeerHandle for Binder {
        async fn handle_peer_command(&self, link: &PeerLink, command: Command) {
            if let Command::Helo { group_id } = command {
                if self.registry.bind_group(link.conn_id(), &group_id).is_ok() {
                    let view = self.registry.servers_view(Some(link.conn_id()));
                    let _ = link.send_command(&Command::Servers(view)).await;
                }
            }
        }

        async fn handle_client_command(&self, _link: &PeerLink, _command: ClientCommand) {}
    }

    async fn node(group_id: &str) -> Arc<PeerNode> {
        node_at(group_id, 4000, 8, 0).await
    }

    /// A node advertising `own_port` while listening on `listen_port`
    /// (0 for ephemeral).
    async fn node_at(
        group_id: &str,
        own_port: u16,
        max_degree: usize,
        listen_port: u16,
    ) -> Arc<PeerNode> {
        let registry = PeerRegistry::new(
            LocalPeer {
                group_id: group_id.to_string(),
                ip: "127.0.0.1".to_string(),
                port: own_port,
            },
            max_degree,
        );
        let handle = Arc::new(Binder {
            registry: registry.clone(),
        });
        let config = PeerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], listen_port)),
            handshake_timeout: Duration::from_secs(2),
        };
        PeerNode::start(config, registry, handle).await.unwrap().0
    }

    /// Reserve `n` consecutive free loopback ports.
    fn free_port_block(n: u16) -> Vec<std::net::TcpListener> {
        (20000..60000u16)
            .step_by(usize::from(n) + 1)
            .find_map(|base| {
                (base..base + n)
                    .map(|port| std::net::TcpListener::bind(("127.0.0.1", port)).ok())
                    .collect::<Option<Vec<_>>>()
            })
            .unwrap()
    }

    /// Accepts connections and drops them straight away.
    fn spawn_refuser(listener: std::net::TcpListener) {
        listener.set_nonblocking(true).unwrap();
        let listener = TcpListener::from_std(listener).unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn quick_config() -> DiscoveryConfig {
        DiscoveryConfig {
            rendezvous_host: "127.0.0.1".to_string(),
            connect_pacing_ms: 10,
            probe_timeout_ms: 100,
            fallback_probe_timeout_ms: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_connect_seeds() {
        let local = node("A5_1").await;
        let a = node("A5_2").await;
        let discovery = Discovery::new(Arc::clone(&local), quick_config());

        let seeds = vec![
            ("127.0.0.1".to_string(), a.local_addr().port()),
            ("127.0.0.1".to_string(), 1),
        ];
        assert_eq!(discovery.connect_seeds(&seeds).await, 1);
        assert!(local.registry().is_group_connected("A5_2"));
    }

    #[tokio::test]
    async fn test_known_peers_respect_cooldown() {
        let local = node("A5_1").await;
        let a = node("A5_2").await;
        let discovery = Discovery::new(Arc::clone(&local), quick_config());
        let port = a.local_addr().port();

        local
            .registry()
            .upsert_known(&[ServerEntry::new("A5_2", "127.0.0.1", port)]);
        local.registry().should_attempt_helo(
            "A5_2",
            Instant::now(),
            Duration::from_secs(60),
        );
        assert_eq!(discovery.try_known_peers().await, 0);

        let fresh = node("A5_3").await;
        let discovery = Discovery::new(Arc::clone(&fresh), quick_config());
        fresh
            .registry()
            .upsert_known(&[ServerEntry::new("A5_2", "127.0.0.1", port)]);
        assert_eq!(discovery.try_known_peers().await, 1);
        assert!(fresh.registry().is_group_connected("A5_2"));
    }

    #[tokio::test]
    async fn test_scan_is_single_flight() {
        let local = node("A5_1").await;
        let discovery = Discovery::new(Arc::clone(&local), quick_config());
        let _held = local.registry().try_begin_scan().unwrap();
        assert!(discovery.trigger_scan().await.is_none());
    }

    #[tokio::test]
    async fn test_trigger_scan_stops_at_min_degree() {
        let local = node("A5_1").await;
        let peer = node("A5_2").await;
        let config = DiscoveryConfig {
            min_degree: 1,
            fallback_ports: vec![],
            ..quick_config()
        };
        let discovery = Discovery::new(Arc::clone(&local), config);
        local.registry().upsert_known(&[ServerEntry::new(
            "A5_2",
            "127.0.0.1",
            peer.local_addr().port(),
        )]);

        let report = discovery.trigger_scan().await.unwrap();
        assert_eq!(report.known, 1);
        assert_eq!(report.scanned, 0);
        assert_eq!(report.total(), 1);
        assert!(!local.registry().is_scanning());
    }

    #[tokio::test]
    async fn test_trusted_only_on_rendezvous_fallbacks() {
        let local = node("A5_1").await;
        let discovery = Discovery::new(local, DiscoveryConfig::default());
        assert!(discovery.is_trusted("130.208.246.98", 5001));
        assert!(!discovery.is_trusted("130.208.246.98", 4001));
        assert!(!discovery.is_trusted("10.0.0.1", 5001));
    }

    #[tokio::test]
    async fn test_scan_dials_past_refusing_neighbors() {
        let mut block = free_port_block(4);
        let ports: Vec<u16> = block.iter().map(|l| l.local_addr().unwrap().port()).collect();
        let (below, own, far) = (ports[0], ports[1], ports[3]);

        let far_listener = block.pop().unwrap();
        let above_listener = block.pop().unwrap();
        drop(block.pop());
        let below_listener = block.pop().unwrap();
        spawn_refuser(below_listener);
        spawn_refuser(above_listener);
        drop(far_listener);
        let _real = node_at("A5_7", 4000, 8, far).await;

        let local = node_at("A5_1", own, 2, 0).await;
        let config = DiscoveryConfig {
            scan_start_port: below,
            scan_end_port: far,
            fallback_ports: vec![],
            max_degree: 2,
            ..quick_config()
        };
        let discovery = Discovery::new(Arc::clone(&local), config);

        let report = discovery.trigger_scan().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert!(local.registry().is_group_connected("A5_7"));
        assert!(local.registry().is_connected_to("127.0.0.1", far));
    }

    #[tokio::test]
    async fn test_fallbacks_probed_and_trusted() {
        let local = node("A5_1").await;
        let rendezvous = node("A5_9").await;
        let config = DiscoveryConfig {
            scan_start_port: 1,
            scan_end_port: 0,
            fallback_ports: vec![closed_port(), rendezvous.local_addr().port()],
            min_degree: 1,
            ..quick_config()
        };
        let discovery = Discovery::new(Arc::clone(&local), config);

        let report = discovery.trigger_scan().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(report.fallback, 1);
        let degree = local.registry().degree();
        assert_eq!(degree.total, 1);
        assert_eq!(degree.trusted, 1);
        assert_eq!(degree.organic(), 0);
    }

    #[tokio::test]
    async fn test_connect_rendezvous_uses_first_fallback() {
        let local = node("A5_1").await;
        let rendezvous = node("A5_9").await;
        let config = DiscoveryConfig {
            fallback_ports: vec![rendezvous.local_addr().port(), closed_port()],
            ..quick_config()
        };
        let discovery = Discovery::new(Arc::clone(&local), config);

        assert!(discovery.connect_rendezvous().await);
        assert!(local.registry().is_group_connected("A5_9"));
        assert_eq!(local.registry().degree().trusted, 1);

        let empty = Discovery::new(
            node("A5_2").await,
            DiscoveryConfig {
                fallback_ports: vec![],
                ..quick_config()
            },
        );
        assert!(!empty.connect_rendezvous().await);
    }
}
