//! PeerNode — TCP listener, outbound connector and per-connection sessions.
//!
//! A [`PeerNode`] binds the overlay's listen port and accepts connections.
//! The first frame on an accepted connection decides what it is: `HELO`
//! starts a peer session, anything else a client session. Outbound
//! connections run the HELO/SERVERS handshake and then share the same peer
//! session loop.
//!
//! The [`PeerHandle`] trait is the seam to the routing layer: sessions parse
//! frames and hand typed commands to it.

use crate::command::{ClientCommand, Command};
use crate::error::{WireError, WireResult};
use crate::frame::read_frame;
use crate::link::PeerLink;
use crate::registry::PeerRegistry;

use async_trait::async_trait;
use hopmesh_types::error::HopmeshError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Configuration for a PeerNode.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// Bound on every handshake read and on outbound connects.
    pub handshake_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Handles commands arriving on peer and client sessions.
#[async_trait]
pub trait PeerHandle: Send + Sync + 'static {
    /// A command from a peer connection. `HELO` is expected to bind the
    /// connection's group id; an inbound connection left unbound after its
    /// first HELO is dropped.
    async fn handle_peer_command(&self, link: &PeerLink, command: Command);

    /// A command from a client connection (never registered as a peer).
    async fn handle_client_command(&self, link: &PeerLink, command: ClientCommand);
}

/// The local overlay node.
pub struct PeerNode {
    config: PeerConfig,
    registry: PeerRegistry,
    handle: Arc<dyn PeerHandle>,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
}

impl PeerNode {
    /// Bind the listener and spawn the accept loop.
    pub async fn start(
        config: PeerConfig,
        registry: PeerRegistry,
        handle: Arc<dyn PeerHandle>,
    ) -> WireResult<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "Listening on {} (group_id={})",
            local_addr,
            registry.local().group_id
        );

        let node = Arc::new(Self {
            config,
            registry,
            handle,
            local_addr,
        });

        let node_clone = Arc::clone(&node);
        let accept_handle = tokio::spawn(async move {
            Self::accept_loop(listener, node_clone).await;
        });

        Ok((node, accept_handle))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn group_id(&self) -> &str {
        &self.registry.local().group_id
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Connect to a server, run the handshake and start its session.
    ///
    /// Returns the remote group id. Already-connected targets and a full
    /// table are reported as [`WireError::Rejected`] without dialing.
    pub async fn connect_to_server(&self, ip: &str, port: u16, trusted: bool) -> WireResult<String> {
        if self.registry.is_connected_to(ip, port) {
            return Err(HopmeshError::AlreadyConnected(format!("{ip}:{port}")).into());
        }
        if self.registry.is_full() {
            return Err(HopmeshError::CapacityExceeded {
                current: self.registry.connection_count(),
                max: self.registry.max_degree(),
            }
            .into());
        }

        info!("Connecting to {}:{}", ip, port);
        let stream = tokio::time::timeout(self.config.handshake_timeout, TcpStream::connect((ip, port)))
            .await
            .map_err(|_| WireError::Timeout("connect"))??;
        let peer_addr = stream.peer_addr()?;
        let (mut reader, writer) = stream.into_split();
        let link = PeerLink::new(self.registry.next_conn_id(), peer_addr, writer);

        let own_id = self.group_id().to_string();
        link.send_command(&Command::Helo {
            group_id: own_id.clone(),
        })
        .await?;

        let mut reply = self.read_handshake(&mut reader, "handshake reply").await?;
        let mut remote_id = None;

        // Symmetric first contact: the remote greeted us too.
        if let Command::Helo { group_id } = reply {
            if group_id == own_id {
                return Err(HopmeshError::SelfConnection(group_id).into());
            }
            if self.registry.is_group_connected(&group_id) {
                return Err(HopmeshError::DuplicateIdentity(group_id).into());
            }
            link.send_command(&Command::Servers(self.registry.servers_view(None)))
                .await?;
            reply = self.read_handshake(&mut reader, "SERVERS").await?;
            remote_id = Some(group_id);
        }

        let Command::Servers(entries) = reply else {
            return Err(WireError::HandshakeFailed(format!(
                "expected SERVERS, got {}",
                reply.verb()
            )));
        };
        let remote_id = remote_id
            .or_else(|| entries.first().map(|e| e.group_id.clone()))
            .ok_or_else(|| WireError::HandshakeFailed("empty SERVERS".into()))?;

        self.registry.upsert_known(&entries);
        self.registry
            .register_outbound(link.clone(), &remote_id, ip, port, trusted)?;

        info!(
            peer = %remote_id,
            trusted,
            total = self.registry.connection_count(),
            "Connected to {}:{}", ip, port
        );

        let registry = self.registry.clone();
        let handle = Arc::clone(&self.handle);
        tokio::spawn(async move {
            if let Err(e) = session_loop(reader, link, &registry, &*handle).await {
                debug!("Outbound session to {} ended: {}", peer_addr, e);
            }
        });

        Ok(remote_id)
    }

    async fn read_handshake(&self, reader: &mut OwnedReadHalf, what: &'static str) -> WireResult<Command> {
        let payload = tokio::time::timeout(self.config.handshake_timeout, read_frame(reader))
            .await
            .map_err(|_| WireError::Timeout(what))??;
        Command::parse(&payload).map_err(|e| WireError::HandshakeFailed(e.to_string()))
    }

    async fn accept_loop(listener: TcpListener, node: Arc<PeerNode>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        if let Err(e) = node.handle_inbound(stream, addr).await {
                            debug!("Inbound connection from {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Classify an accepted connection by its first frame and run its session.
    ///
    /// The first read is unbounded: interactive clients may idle before their
    /// first command.
    async fn handle_inbound(&self, stream: TcpStream, addr: SocketAddr) -> WireResult<()> {
        let (mut reader, writer) = stream.into_split();
        let first = read_frame(&mut reader).await?;
        let link = PeerLink::new(self.registry.next_conn_id(), addr, writer);

        match Command::parse(&first) {
            Ok(helo @ Command::Helo { .. }) => {
                if let Err(e) = self.registry.register_inbound(link.clone(), &addr.ip().to_string()) {
                    warn!("Rejecting peer from {}: {}", addr, e);
                    return Err(e.into());
                }
                self.handle.handle_peer_command(&link, helo).await;
                if self.registry.group_of(link.conn_id()).is_none() {
                    self.registry.disconnect(link.conn_id());
                    link.shutdown().await;
                    return Err(WireError::HandshakeFailed(format!("HELO from {addr} not accepted")));
                }
                session_loop(reader, link, &self.registry, &*self.handle).await
            }
            _ => client_loop(first, reader, link, &*self.handle).await,
        }
    }
}

/// Receive loop for an id-bound peer. Ends on read failure or eviction and
/// always deregisters the connection.
async fn session_loop(
    mut reader: OwnedReadHalf,
    link: PeerLink,
    registry: &PeerRegistry,
    handle: &dyn PeerHandle,
) -> WireResult<()> {
    let conn_id = link.conn_id();
    let result = loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(payload) => {
                    registry.touch(conn_id);
                    match Command::parse(&payload) {
                        Ok(command) => handle.handle_peer_command(&link, command).await,
                        Err(e) => debug!(conn = %conn_id, "Ignoring frame: {}", e),
                    }
                }
                Err(WireError::ConnectionClosed) => break Ok(()),
                Err(e) => break Err(e),
            },
            _ = link.closed() => {
                debug!(conn = %conn_id, "Session closed by eviction");
                break Ok(());
            }
        }
    };

    if let Some(conn) = registry.disconnect(conn_id) {
        info!(
            peer = %conn.group_id,
            total = registry.connection_count(),
            "Peer disconnected"
        );
    }
    link.shutdown().await;
    result
}

/// Loop for a client connection. `first` is the already-read opening frame.
async fn client_loop(
    first: String,
    mut reader: OwnedReadHalf,
    link: PeerLink,
    handle: &dyn PeerHandle,
) -> WireResult<()> {
    info!("Client connected from {}", link.addr());
    let mut payload = first;
    loop {
        match ClientCommand::parse(&payload) {
            Ok(ClientCommand::Quit) => break,
            Ok(command) => handle.handle_client_command(&link, command).await,
            Err(e) => debug!("Ignoring client frame from {}: {}", link.addr(), e),
        }
        payload = match read_frame(&mut reader).await {
            Ok(p) => p,
            Err(WireError::ConnectionClosed) => break,
            Err(e) => return Err(e),
        };
    }
    info!("Client {} disconnected", link.addr());
    link.shutdown().await;
    Ok(())
}
