//! Health monitor — keepalives, message pulls, status polls and eviction.
//!
//! One background task wakes every tick, fires whichever broadcasts are due,
//! evicts peers whose sends failed or that have gone silent, and then decides
//! whether the node needs more connections.

use hopmesh_types::config::HealthConfig;
use hopmesh_wire::command::Command;
use hopmesh_wire::discovery::Discovery;
use hopmesh_wire::link::ConnId;
use hopmesh_wire::registry::{Degree, PeerRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A periodic broadcast to every id-bound peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Broadcast {
    Keepalive,
    GetMsgs,
    StatusReq,
}

/// Tracks when each broadcast last fired.
#[derive(Debug, Clone)]
pub struct HealthSchedule {
    keepalive: Duration,
    getmsgs: Duration,
    statusreq: Duration,
    last_keepalive: Instant,
    last_getmsgs: Instant,
    last_statusreq: Instant,
}

impl HealthSchedule {
    pub fn new(config: &HealthConfig, start: Instant) -> Self {
        Self {
            keepalive: config.keepalive(),
            getmsgs: config.getmsgs(),
            statusreq: config.statusreq(),
            last_keepalive: start,
            last_getmsgs: start,
            last_statusreq: start,
        }
    }

    /// Broadcasts due at `now`, in firing order. Marks them as fired.
    pub fn due(&mut self, now: Instant) -> Vec<Broadcast> {
        let mut due = Vec::new();
        if now.saturating_duration_since(self.last_keepalive) >= self.keepalive {
            self.last_keepalive = now;
            due.push(Broadcast::Keepalive);
        }
        if now.saturating_duration_since(self.last_getmsgs) >= self.getmsgs {
            self.last_getmsgs = now;
            due.push(Broadcast::GetMsgs);
        }
        if now.saturating_duration_since(self.last_statusreq) >= self.statusreq {
            self.last_statusreq = now;
            due.push(Broadcast::StatusReq);
        }
        due
    }
}

/// Discovery work a tick asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rediscovery {
    Idle,
    /// Retry cached known peers only.
    KnownPeers,
    /// Known peers, then scanning and fallbacks.
    FullScan,
}

/// Decide what discovery the current degree calls for.
///
/// Below the minimum degree the node runs full discovery. With enough
/// connections overall but too few organic ones (and room left), it only
/// retries known peers.
pub fn rediscovery_action(degree: Degree, min_degree: usize, max_degree: usize) -> Rediscovery {
    if degree.total < min_degree {
        Rediscovery::FullScan
    } else if degree.organic() < min_degree && degree.total < max_degree {
        Rediscovery::KnownPeers
    } else {
        Rediscovery::Idle
    }
}

/// Outcome of one monitor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub broadcasts: Vec<Broadcast>,
    pub evicted: usize,
    pub rediscovery: Rediscovery,
}

/// Periodic maintenance of the node's peer set.
pub struct HealthMonitor {
    registry: PeerRegistry,
    discovery: Arc<Discovery>,
    config: HealthConfig,
    schedule: HealthSchedule,
}

impl HealthMonitor {
    pub fn new(registry: PeerRegistry, discovery: Arc<Discovery>, config: HealthConfig) -> Self {
        let schedule = HealthSchedule::new(&config, Instant::now());
        Self {
            registry,
            discovery,
            config,
            schedule,
        }
    }

    /// Run one maintenance pass as of `now`.
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        let broadcasts = self.schedule.due(now);

        let mut failed = Vec::new();
        for kind in &broadcasts {
            failed.extend(self.broadcast(*kind).await);
        }
        let mut evicted = self.registry.evict(&failed).len();

        for conn in self.registry.evict_stale(now, self.config.stale()) {
            info!(
                peer = %conn.group_id,
                silent_secs = now.saturating_duration_since(conn.last_seen).as_secs(),
                "Evicting stale peer"
            );
            evicted += 1;
        }

        let discovery = self.discovery.config();
        let rediscovery = rediscovery_action(
            self.registry.degree(),
            discovery.min_degree,
            discovery.max_degree,
        );
        match rediscovery {
            Rediscovery::FullScan => {
                info!(
                    total = self.registry.connection_count(),
                    min = discovery.min_degree,
                    "Below minimum degree, starting discovery"
                );
                self.discovery.trigger_scan().await;
            }
            Rediscovery::KnownPeers => {
                debug!("Few organic peers, retrying known peers");
                self.discovery.try_known_peers().await;
            }
            Rediscovery::Idle => {}
        }

        self.log_status();
        TickReport {
            broadcasts,
            evicted,
            rediscovery,
        }
    }

    /// Send one broadcast; returns the connections whose send failed.
    async fn broadcast(&self, kind: Broadcast) -> Vec<ConnId> {
        let own = self.registry.local().group_id.clone();
        let mut failed = Vec::new();

        for (peer, link) in self.registry.bound_peers() {
            let command = match kind {
                Broadcast::Keepalive => Command::Keepalive {
                    queued: self.registry.queue_len(&peer),
                },
                Broadcast::GetMsgs => Command::GetMsgs {
                    group_id: own.clone(),
                },
                Broadcast::StatusReq => Command::StatusReq,
            };
            if let Err(e) = link.send_command(&command).await {
                warn!(peer = %peer, verb = command.verb(), error = %e, "Removing dead connection");
                failed.push(link.conn_id());
            }
        }

        debug!(kind = ?kind, failed = failed.len(), "Broadcast sent");
        failed
    }

    fn log_status(&self) {
        let degree = self.registry.degree();
        let counters = self.registry.counters();
        info!(
            connections = degree.total,
            organic = degree.organic(),
            trusted = degree.trusted,
            queued = self.registry.queued_total(),
            received = counters.received,
            sent = counters.sent,
            forwarded = counters.forwarded,
            loops = counters.loops_detected,
            "Status"
        );
    }

    /// Run the monitor until the shutdown signal fires.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.config.tick();
        info!(tick_secs = interval.as_secs(), "Starting health monitor");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        info!("Health monitor: shutdown signal received");
                        break;
                    }
                }
                self.tick(Instant::now()).await;
            }
        })
    }
}
