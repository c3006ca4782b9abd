//! Router — forwarding, queueing and loop suppression.
//!
//! The [`Router`] is the kernel's [`PeerHandle`]: every command a session
//! decodes lands here. SENDMSG traffic is either dropped (loop), queued where
//! it is (hop limit or addressed to us), forwarded on a direct connection, or
//! queued and flooded to every peer not already on its hop trail.

use async_trait::async_trait;
use hopmesh_types::config::RoutingConfig;
use hopmesh_wire::command::{ClientCommand, Command, HopTrail, SendMsg, ServerEntry};
use hopmesh_wire::link::PeerLink;
use hopmesh_wire::peer::PeerHandle;
use hopmesh_wire::registry::PeerRegistry;
use hopmesh_wire::store::QueuedMessage;
use tracing::{debug, info, warn};

/// What happened to a routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Our id was already on the hop trail.
    LoopDropped,
    /// Hop ceiling reached; parked in the destination's queue here.
    HopLimitQueued,
    /// Addressed to this node; stored in our own queue.
    DeliveredLocally,
    /// Sent on a direct connection to the destination.
    Forwarded,
    /// No usable route: queued and sent to `flooded` peers.
    QueuedAndFlooded { flooded: usize },
}

/// Routing policy over the shared registry.
#[derive(Debug, Clone)]
pub struct Router {
    registry: PeerRegistry,
    max_hops: usize,
}

impl Router {
    pub fn new(registry: PeerRegistry, config: &RoutingConfig) -> Self {
        Self {
            registry,
            max_hops: config.max_hops,
        }
    }

    fn own_id(&self) -> &str {
        &self.registry.local().group_id
    }

    /// Route a SENDMSG received from a peer.
    pub async fn route(&self, msg: SendMsg) -> RouteOutcome {
        let own = self.own_id().to_string();

        if msg.hops.contains(&own) {
            let loops = self.registry.record_loop();
            info!(
                from = %msg.from,
                to = %msg.to,
                hops = %msg.hops,
                loops,
                "Loop detected, dropping message"
            );
            return RouteOutcome::LoopDropped;
        }

        let hop_count = msg.hops.count();
        if hop_count >= self.max_hops {
            warn!(
                from = %msg.from,
                to = %msg.to,
                hop_count,
                "Hop limit reached, queueing locally"
            );
            // Queued without its trail so the next pickup starts a fresh route.
            self.registry.enqueue(QueuedMessage::new(SendMsg {
                hops: HopTrail::default(),
                ..msg
            }));
            return RouteOutcome::HopLimitQueued;
        }

        if msg.to == own {
            info!(from = %msg.from, hop_count, "Message delivered: {}", msg.content);
            self.registry.enqueue(QueuedMessage::new(msg));
            self.registry.record_received();
            return RouteOutcome::DeliveredLocally;
        }

        let msg = SendMsg {
            hops: msg.hops.extended(&msg.from, &own),
            ..msg
        };

        if let Some(link) = self.registry.lookup_by_group(&msg.to) {
            match link.send_command(&Command::SendMsg(msg.clone())).await {
                Ok(()) => {
                    self.registry.record_forwarded();
                    info!(from = %msg.from, to = %msg.to, hops = %msg.hops, "Forwarded message");
                    return RouteOutcome::Forwarded;
                }
                Err(e) => {
                    warn!(to = %msg.to, error = %e, "Direct forward failed, queueing");
                }
            }
        }

        self.queue_and_flood(msg).await
    }

    /// Route a message a client submitted through this node.
    pub async fn originate(&self, to: String, content: String) -> RouteOutcome {
        let own = self.own_id().to_string();
        let msg = SendMsg {
            to,
            from: own.clone(),
            content,
            hops: HopTrail::new(own.clone()),
        };

        if msg.to == own {
            info!("Client message addressed to this node, queueing");
            self.registry.enqueue(QueuedMessage::new(msg));
            self.registry.record_received();
            return RouteOutcome::DeliveredLocally;
        }

        if let Some(link) = self.registry.lookup_by_group(&msg.to) {
            match link.send_command(&Command::SendMsg(msg.clone())).await {
                Ok(()) => {
                    self.registry.record_sent();
                    info!(to = %msg.to, "Sent client message");
                    return RouteOutcome::Forwarded;
                }
                Err(e) => {
                    warn!(to = %msg.to, error = %e, "Direct send failed, queueing");
                }
            }
        }

        self.queue_and_flood(msg).await
    }

    async fn queue_and_flood(&self, msg: SendMsg) -> RouteOutcome {
        self.registry.enqueue(QueuedMessage::new(msg.clone()));

        let command = Command::SendMsg(msg.clone());
        let mut flooded = 0;
        for (peer, link) in self.registry.bound_peers() {
            if msg.hops.contains(&peer) {
                continue;
            }
            match link.send_command(&command).await {
                Ok(()) => flooded += 1,
                Err(e) => debug!(peer = %peer, error = %e, "Flood send failed"),
            }
        }

        info!(to = %msg.to, flooded, "No direct route, queued and flooded");
        RouteOutcome::QueuedAndFlooded { flooded }
    }

    async fn reply(&self, link: &PeerLink, command: Command) {
        if let Err(e) = link.send_command(&command).await {
            debug!(conn = %link.conn_id(), verb = command.verb(), error = %e, "Reply failed");
        }
    }

    async fn handle_helo(&self, link: &PeerLink, from: &str) {
        match self.registry.bind_group(link.conn_id(), from) {
            Ok(()) => {
                info!(
                    peer = %from,
                    total = self.registry.connection_count(),
                    "Accepted HELO"
                );
                let view = self.registry.servers_view(Some(link.conn_id()));
                self.reply(link, Command::Servers(view)).await;
            }
            Err(e) => debug!(peer = %from, error = %e, "Ignoring HELO"),
        }
    }

    fn handle_servers(&self, link: &PeerLink, peer: &str, entries: &[ServerEntry]) {
        if let Some(first) = entries.first() {
            if !peer.is_empty() && first.group_id == peer {
                self.registry.set_listen_port(link.conn_id(), first.port);
            }
        }
        let merged = self.registry.upsert_known(entries);
        debug!(peer = %peer, entries = entries.len(), merged, "SERVERS merged");
    }
}

#[async_trait]
impl PeerHandle for Router {
    async fn handle_peer_command(&self, link: &PeerLink, command: Command) {
        let peer = self.registry.group_of(link.conn_id()).unwrap_or_default();

        match command {
            Command::Helo { group_id } => self.handle_helo(link, &group_id).await,
            Command::Servers(entries) => self.handle_servers(link, &peer, &entries),
            Command::Keepalive { queued } => {
                debug!(peer = %peer, queued, "KEEPALIVE");
                if queued > 0 {
                    let pull = Command::GetMsgs {
                        group_id: self.own_id().to_string(),
                    };
                    self.reply(link, pull).await;
                }
            }
            Command::GetMsgs { group_id } => {
                let reply = match self.registry.pop_message(&group_id) {
                    Some(message) => {
                        info!(peer = %peer, group = %group_id, "Handing over queued message");
                        message.into_sendmsg()
                    }
                    None => Command::NoMessages,
                };
                self.reply(link, reply).await;
            }
            Command::SendMsg(msg) => {
                self.route(msg).await;
            }
            Command::StatusReq => {
                let summary = self.registry.queue_summary();
                self.reply(link, Command::StatusResp(summary)).await;
            }
            Command::StatusResp(queues) => {
                info!(peer = %peer, queues = ?queues, "STATUSRESP");
            }
            Command::NoMessages => debug!(peer = %peer, "NO_MESSAGES"),
            Command::Ok { detail } => debug!(peer = %peer, detail = %detail, "Ignoring OK from peer"),
        }
    }

    async fn handle_client_command(&self, link: &PeerLink, command: ClientCommand) {
        match command {
            ClientCommand::SendMsg { to, content } => {
                let detail = match self.originate(to, content).await {
                    RouteOutcome::Forwarded => "Delivered",
                    _ => "Queued",
                };
                self.reply(
                    link,
                    Command::Ok {
                        detail: detail.to_string(),
                    },
                )
                .await;
            }
            ClientCommand::GetMsg => {
                let reply = match self.registry.pop_message(self.own_id()) {
                    Some(message) => Command::SendMsg(SendMsg {
                        to: message.to,
                        from: message.from,
                        content: message.content,
                        hops: HopTrail::default(),
                    }),
                    None => Command::NoMessages,
                };
                self.reply(link, reply).await;
            }
            ClientCommand::ListServers => {
                let view = self.registry.servers_view(None);
                self.reply(link, Command::Servers(view)).await;
            }
            ClientCommand::Quit => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopmesh_wire::frame::read_frame;
    use hopmesh_wire::registry::LocalPeer;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn setup() -> (PeerRegistry, Router) {
        let registry = PeerRegistry::new(
            LocalPeer {
                group_id: "A5_1".to_string(),
                ip: "10.0.0.1".to_string(),
                port: 4000,
            },
            8,
        );
        let router = Router::new(registry.clone(), &RoutingConfig::default());
        (registry, router)
    }

    fn link(registry: &PeerRegistry) -> (PeerLink, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(8192);
        let link = PeerLink::new(
            registry.next_conn_id(),
            "127.0.0.1:9999".parse().unwrap(),
            ours,
        );
        (link, theirs)
    }

    fn peer(registry: &PeerRegistry, group: &str, port: u16) -> (PeerLink, DuplexStream) {
        let (l, io) = link(registry);
        registry
            .register_outbound(l.clone(), group, "10.0.0.9", port, false)
            .unwrap();
        (l, io)
    }

    async fn recv(io: &mut DuplexStream) -> Command {
        let payload = tokio::time::timeout(Duration::from_secs(1), read_frame(io))
            .await
            .unwrap()
            .unwrap();
        Command::parse(&payload).unwrap()
    }

    async fn assert_silent(io: &mut DuplexStream) {
        let read = tokio::time::timeout(Duration::from_millis(50), read_frame(io)).await;
        assert!(read.is_err(), "expected no frame, got {read:?}");
    }

    fn sendmsg(to: &str, from: &str, hops: &str) -> SendMsg {
        SendMsg {
            to: to.to_string(),
            from: from.to_string(),
            content: "hello".to_string(),
            hops: HopTrail::new(hops),
        }
    }

    fn trail(len: usize) -> String {
        (0..len)
            .map(|i| format!("N{i}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    #[tokio::test]
    async fn test_helo_reply_lists_self() {
        let (registry, router) = setup();
        let (l, mut io) = link(&registry);
        registry.register_inbound(l.clone(), "10.0.0.2").unwrap();

        router
            .handle_peer_command(
                &l,
                Command::Helo {
                    group_id: "A5_2".to_string(),
                },
            )
            .await;

        let reply = recv(&mut io).await;
        assert_eq!(reply.to_wire(), "SERVERS,A5_1,10.0.0.1,4000");
        assert_eq!(registry.group_of(l.conn_id()).as_deref(), Some("A5_2"));
    }

    #[tokio::test]
    async fn test_duplicate_helo_ignored() {
        let (registry, router) = setup();
        let (_a, _a_io) = peer(&registry, "A5_2", 4001);
        let (l, mut io) = link(&registry);
        registry.register_inbound(l.clone(), "10.0.0.2").unwrap();

        router
            .handle_peer_command(
                &l,
                Command::Helo {
                    group_id: "A5_2".to_string(),
                },
            )
            .await;
        assert_silent(&mut io).await;
        assert!(registry.group_of(l.conn_id()).is_none());
    }

    #[tokio::test]
    async fn test_unroutable_queued_then_pulled_once() {
        let (registry, router) = setup();
        let outcome = router.route(sendmsg("A5_9", "A5_3", "A5_3")).await;
        assert_eq!(outcome, RouteOutcome::QueuedAndFlooded { flooded: 0 });
        assert_eq!(registry.queue_len("A5_9"), 1);

        let (l, mut io) = peer(&registry, "A5_9", 4009);
        let pull = Command::GetMsgs {
            group_id: "A5_9".to_string(),
        };
        router.handle_peer_command(&l, pull.clone()).await;
        assert_eq!(
            recv(&mut io).await,
            Command::SendMsg(sendmsg("A5_9", "A5_3", "A5_3,A5_1"))
        );

        router.handle_peer_command(&l, pull).await;
        assert_eq!(recv(&mut io).await, Command::NoMessages);
    }

    #[tokio::test]
    async fn test_loop_dropped() {
        let (registry, router) = setup();
        let (_l, mut io) = peer(&registry, "A5_2", 4001);

        let outcome = router.route(sendmsg("A5_9", "A5_3", "A5_3,A5_1,A5_4")).await;
        assert_eq!(outcome, RouteOutcome::LoopDropped);
        assert_eq!(registry.counters().loops_detected, 1);
        assert!(registry.queue_summary().is_empty());
        assert_silent(&mut io).await;
    }

    #[tokio::test]
    async fn test_hop_limit_boundary() {
        let (registry, router) = setup();
        let (_l, mut io) = peer(&registry, "A5_2", 4001);

        let below = router.route(sendmsg("A5_9", "N0", &trail(47))).await;
        assert_eq!(below, RouteOutcome::QueuedAndFlooded { flooded: 1 });
        assert!(matches!(recv(&mut io).await, Command::SendMsg(_)));

        let at = router.route(sendmsg("A5_9", "N0", &trail(48))).await;
        assert_eq!(at, RouteOutcome::HopLimitQueued);
        assert_silent(&mut io).await;

        assert_eq!(registry.queue_len("A5_9"), 2);
        registry.pop_message("A5_9").unwrap();

        let (l, mut puller) = peer(&registry, "A5_9", 4009);
        let pull = Command::GetMsgs {
            group_id: "A5_9".to_string(),
        };
        router.handle_peer_command(&l, pull).await;
        assert_eq!(
            recv(&mut puller).await,
            Command::SendMsg(sendmsg("A5_9", "N0", ""))
        );
    }

    #[tokio::test]
    async fn test_direct_forward_seeds_empty_trail() {
        let (registry, router) = setup();
        let (_l, mut io) = peer(&registry, "A5_2", 4001);

        let outcome = router.route(sendmsg("A5_2", "A5_3", "")).await;
        assert_eq!(outcome, RouteOutcome::Forwarded);
        assert_eq!(
            recv(&mut io).await,
            Command::SendMsg(sendmsg("A5_2", "A5_3", "A5_3"))
        );

        router.route(sendmsg("A5_2", "A5_3", "A5_3")).await;
        assert_eq!(
            recv(&mut io).await,
            Command::SendMsg(sendmsg("A5_2", "A5_3", "A5_3,A5_1"))
        );
        assert_eq!(registry.counters().forwarded, 2);
        assert_eq!(registry.queue_len("A5_2"), 0);
    }

    #[tokio::test]
    async fn test_message_for_self() {
        let (registry, router) = setup();
        let outcome = router.route(sendmsg("A5_1", "A5_3", "A5_3")).await;
        assert_eq!(outcome, RouteOutcome::DeliveredLocally);
        assert_eq!(registry.queue_len("A5_1"), 1);
        assert_eq!(registry.counters().received, 1);
    }

    #[tokio::test]
    async fn test_flood_skips_peers_on_trail() {
        let (registry, router) = setup();
        let (_a, mut a_io) = peer(&registry, "A5_2", 4001);
        let (_b, mut b_io) = peer(&registry, "A5_4", 4003);

        let outcome = router.route(sendmsg("A5_9", "A5_2", "A5_2")).await;
        assert_eq!(outcome, RouteOutcome::QueuedAndFlooded { flooded: 1 });
        assert_eq!(
            recv(&mut b_io).await,
            Command::SendMsg(sendmsg("A5_9", "A5_2", "A5_2,A5_1"))
        );
        assert_silent(&mut a_io).await;
    }

    #[tokio::test]
    async fn test_failed_forward_falls_back_to_queue() {
        let (registry, router) = setup();
        let (_l, io) = peer(&registry, "A5_2", 4001);
        drop(io);

        let outcome = router.route(sendmsg("A5_2", "A5_3", "A5_3")).await;
        assert_eq!(outcome, RouteOutcome::QueuedAndFlooded { flooded: 0 });
        assert_eq!(registry.queue_len("A5_2"), 1);
        assert_eq!(registry.counters().forwarded, 0);
    }

    #[tokio::test]
    async fn test_keepalive_with_backlog_pulls() {
        let (registry, router) = setup();
        let (l, mut io) = peer(&registry, "A5_2", 4001);

        router
            .handle_peer_command(&l, Command::Keepalive { queued: 0 })
            .await;
        assert_silent(&mut io).await;

        router
            .handle_peer_command(&l, Command::Keepalive { queued: 3 })
            .await;
        assert_eq!(
            recv(&mut io).await,
            Command::GetMsgs {
                group_id: "A5_1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_statusreq_reports_queues() {
        let (registry, router) = setup();
        let (l, mut io) = peer(&registry, "A5_2", 4001);
        router.route(sendmsg("A5_9", "A5_3", "")).await;
        // The flood copy reaches A5_2 first.
        recv(&mut io).await;

        router.handle_peer_command(&l, Command::StatusReq).await;
        assert_eq!(
            recv(&mut io).await,
            Command::StatusResp(vec![("A5_9".to_string(), 1)])
        );
    }

    #[tokio::test]
    async fn test_servers_learns_peer_port() {
        let (registry, router) = setup();
        let (l, _io) = link(&registry);
        registry.register_inbound(l.clone(), "10.0.0.2").unwrap();
        registry.bind_group(l.conn_id(), "A5_2").unwrap();
        assert_eq!(registry.servers_view(None).len(), 1);

        router
            .handle_peer_command(
                &l,
                Command::Servers(vec![
                    ServerEntry::new("A5_2", "10.0.0.2", 4002),
                    ServerEntry::new("A5_5", "10.0.0.5", 4005),
                ]),
            )
            .await;

        assert_eq!(
            registry.servers_view(None)[1],
            ServerEntry::new("A5_2", "10.0.0.2", 4002)
        );
        let known = registry.known_peers();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].group_id, "A5_5");
    }

    #[tokio::test]
    async fn test_client_sendmsg_replies() {
        let (registry, router) = setup();
        let (client, mut client_io) = link(&registry);

        let send = |to: &str| ClientCommand::SendMsg {
            to: to.to_string(),
            content: "hi there".to_string(),
        };

        router.handle_client_command(&client, send("A5_2")).await;
        assert_eq!(
            recv(&mut client_io).await,
            Command::Ok {
                detail: "Queued".to_string()
            }
        );

        let (_p, mut peer_io) = peer(&registry, "A5_2", 4001);
        router.handle_client_command(&client, send("A5_2")).await;
        assert_eq!(
            recv(&mut client_io).await,
            Command::Ok {
                detail: "Delivered".to_string()
            }
        );
        match recv(&mut peer_io).await {
            Command::SendMsg(m) => {
                assert_eq!(m.from, "A5_1");
                assert_eq!(m.hops.as_str(), "A5_1");
                assert_eq!(m.content, "hi there");
            }
            other => panic!("Expected SendMsg, got {other:?}"),
        }
        assert_eq!(registry.counters().sent, 1);
    }

    #[tokio::test]
    async fn test_client_message_to_self_stays_local() {
        let (registry, router) = setup();
        let (client, mut client_io) = link(&registry);
        let (_p, mut peer_io) = peer(&registry, "A5_2", 4001);

        router
            .handle_client_command(
                &client,
                ClientCommand::SendMsg {
                    to: "A5_1".to_string(),
                    content: "note".to_string(),
                },
            )
            .await;
        assert_eq!(
            recv(&mut client_io).await,
            Command::Ok {
                detail: "Queued".to_string()
            }
        );
        assert_eq!(registry.queue_len("A5_1"), 1);
        assert_eq!(registry.counters().received, 1);
        assert_silent(&mut peer_io).await;
    }

    #[tokio::test]
    async fn test_client_getmsg_strips_trail() {
        let (registry, router) = setup();
        let (client, mut client_io) = link(&registry);
        router.route(sendmsg("A5_1", "A5_3", "A5_3,A5_4")).await;

        router
            .handle_client_command(&client, ClientCommand::GetMsg)
            .await;
        assert_eq!(
            recv(&mut client_io).await,
            Command::SendMsg(sendmsg("A5_1", "A5_3", ""))
        );

        router
            .handle_client_command(&client, ClientCommand::GetMsg)
            .await;
        assert_eq!(recv(&mut client_io).await, Command::NoMessages);
    }

    #[tokio::test]
    async fn test_client_listservers() {
        let (registry, router) = setup();
        let (client, mut client_io) = link(&registry);
        let (_p, _io) = peer(&registry, "A5_2", 4001);

        router
            .handle_client_command(&client, ClientCommand::ListServers)
            .await;
        assert_eq!(
            recv(&mut client_io).await.to_wire(),
            "SERVERS,A5_1,10.0.0.1,4000;A5_2,10.0.0.9,4001"
        );
    }
}
