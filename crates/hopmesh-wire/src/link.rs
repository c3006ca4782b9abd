//! Outbound half of a connection, shareable between tasks.

use crate::command::Command;
use crate::error::WireResult;
use crate::frame::write_frame;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

/// Identifies one connection for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

type FrameWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handle used to send frames to a peer and to ask its session to stop.
///
/// The session task owns the read half; every other task (router, health
/// monitor) talks to the peer through a clone of this link. Writes are
/// serialized per connection so frames never interleave.
#[derive(Clone)]
pub struct PeerLink {
    conn_id: ConnId,
    addr: SocketAddr,
    writer: Arc<Mutex<FrameWriter>>,
    closed: Arc<Notify>,
}

impl PeerLink {
    pub fn new<W>(conn_id: ConnId, addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            conn_id,
            addr,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            closed: Arc::new(Notify::new()),
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one raw payload.
    pub async fn send(&self, payload: &str) -> WireResult<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, payload).await
    }

    pub async fn send_command(&self, command: &Command) -> WireResult<()> {
        self.send(&command.to_wire()).await
    }

    /// Ask the owning session to stop reading and drop the connection.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    /// Resolves once [`PeerLink::close`] has been called.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }

    /// Half-close the write side; errors are irrelevant at this point.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("conn_id", &self.conn_id)
            .field("addr", &self.addr)
            .finish()
    }
}
