//! Peer registry — live connections, known peers, queues and counters.
//!
//! All mutable overlay state lives in one [`RegistryState`] behind a single
//! lock so that capacity, address uniqueness and group-id uniqueness are
//! checked and updated together. The lock is never held across an `.await`;
//! callers get [`PeerLink`] clones out and write to them after it is released.

use crate::command::ServerEntry;
use crate::link::{ConnId, PeerLink};
use crate::store::{MessageStore, QueuedMessage};
use chrono::{DateTime, Utc};
use hopmesh_types::error::{HopmeshError, HopmeshResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// This node's own identity as advertised in SERVERS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    pub group_id: String,
    pub ip: String,
    pub port: u16,
}

impl LocalPeer {
    pub fn as_entry(&self) -> ServerEntry {
        ServerEntry::new(&self.group_id, &self.ip, self.port)
    }
}

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A live peer connection.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    pub link: PeerLink,
    /// Remote group id; empty until the handshake binds it.
    pub group_id: String,
    pub ip: String,
    /// Remote listen port; 0 until learned.
    pub port: u16,
    pub last_seen: Instant,
    pub connected_since: DateTime<Utc>,
    pub direction: Direction,
    /// Set for connections to the rendezvous host's fallback ports.
    pub trusted: bool,
}

impl PeerConnection {
    pub fn conn_id(&self) -> ConnId {
        self.link.conn_id()
    }

    pub fn is_bound(&self) -> bool {
        !self.group_id.is_empty()
    }
}

/// A peer learned from SERVERS gossip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPeer {
    pub group_id: String,
    pub ip: String,
    pub port: u16,
    pub last_heard: DateTime<Utc>,
}

/// Message counters since start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub received: u64,
    pub sent: u64,
    pub forwarded: u64,
    pub loops_detected: u64,
}

/// Connection counts split by trust.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Degree {
    pub total: usize,
    pub trusted: usize,
}

impl Degree {
    /// Connections found through gossip or scanning rather than fallback ports.
    pub fn organic(&self) -> usize {
        self.total - self.trusted
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: BTreeMap<ConnId, PeerConnection>,
    group_ids: HashSet<String>,
    known: BTreeMap<String, KnownPeer>,
    store: MessageStore,
    helo_attempts: HashMap<String, Instant>,
    scanning: bool,
    counters: Counters,
    next_conn_id: u64,
}

impl RegistryState {
    fn connected_to(&self, ip: &str, port: u16) -> bool {
        self.connections
            .values()
            .any(|c| c.port == port && c.ip == ip)
    }

    fn remove(&mut self, conn_id: ConnId) -> Option<PeerConnection> {
        let conn = self.connections.remove(&conn_id)?;
        if conn.is_bound() {
            self.group_ids.remove(&conn.group_id);
            self.helo_attempts.remove(&conn.group_id);
        }
        Some(conn)
    }
}

/// Thread-safe registry of all overlay state.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    local: Arc<LocalPeer>,
    max_degree: usize,
    state: Arc<Mutex<RegistryState>>,
}

impl PeerRegistry {
    pub fn new(local: LocalPeer, max_degree: usize) -> Self {
        Self {
            local: Arc::new(local),
            max_degree,
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    /// Allocate an id for a connection that is about to be registered.
    pub fn next_conn_id(&self) -> ConnId {
        let mut state = self.lock();
        state.next_conn_id += 1;
        ConnId(state.next_conn_id)
    }

    // --- connection table ---

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.connection_count() >= self.max_degree
    }

    pub fn degree(&self) -> Degree {
        let state = self.lock();
        Degree {
            total: state.connections.len(),
            trusted: state.connections.values().filter(|c| c.trusted).count(),
        }
    }

    pub fn is_connected_to(&self, ip: &str, port: u16) -> bool {
        self.lock().connected_to(ip, port)
    }

    pub fn is_group_connected(&self, group_id: &str) -> bool {
        self.lock().group_ids.contains(group_id)
    }

    /// Register an outbound connection whose handshake has completed.
    pub fn register_outbound(
        &self,
        link: PeerLink,
        group_id: &str,
        ip: &str,
        port: u16,
        trusted: bool,
    ) -> HopmeshResult<()> {
        if group_id == self.local.group_id {
            return Err(HopmeshError::SelfConnection(group_id.to_string()));
        }
        let mut state = self.lock();
        if state.group_ids.contains(group_id) {
            return Err(HopmeshError::DuplicateIdentity(group_id.to_string()));
        }
        if state.connected_to(ip, port) {
            return Err(HopmeshError::AlreadyConnected(format!("{ip}:{port}")));
        }
        if state.connections.len() >= self.max_degree {
            return Err(HopmeshError::CapacityExceeded {
                current: state.connections.len(),
                max: self.max_degree,
            });
        }

        state.group_ids.insert(group_id.to_string());
        state.connections.insert(
            link.conn_id(),
            PeerConnection {
                link,
                group_id: group_id.to_string(),
                ip: ip.to_string(),
                port,
                last_seen: Instant::now(),
                connected_since: Utc::now(),
                direction: Direction::Outgoing,
                trusted,
            },
        );
        Ok(())
    }

    /// Register an accepted connection before its HELO is processed.
    pub fn register_inbound(&self, link: PeerLink, ip: &str) -> HopmeshResult<()> {
        let mut state = self.lock();
        if state.connections.len() >= self.max_degree {
            return Err(HopmeshError::CapacityExceeded {
                current: state.connections.len(),
                max: self.max_degree,
            });
        }
        state.connections.insert(
            link.conn_id(),
            PeerConnection {
                link,
                group_id: String::new(),
                ip: ip.to_string(),
                port: 0,
                last_seen: Instant::now(),
                connected_since: Utc::now(),
                direction: Direction::Incoming,
                trusted: false,
            },
        );
        Ok(())
    }

    /// Bind a remote group id to an unbound connection.
    pub fn bind_group(&self, conn_id: ConnId, group_id: &str) -> HopmeshResult<()> {
        if group_id == self.local.group_id {
            return Err(HopmeshError::SelfConnection(group_id.to_string()));
        }
        let mut state = self.lock();
        if state.group_ids.contains(group_id) {
            return Err(HopmeshError::DuplicateIdentity(group_id.to_string()));
        }
        let conn = state
            .connections
            .get_mut(&conn_id)
            .ok_or(HopmeshError::UnknownConnection(conn_id.0))?;
        if conn.is_bound() {
            return Err(HopmeshError::InvalidInput(format!(
                "{conn_id} is already bound to {}",
                conn.group_id
            )));
        }
        conn.group_id = group_id.to_string();
        state.group_ids.insert(group_id.to_string());
        Ok(())
    }

    /// Remove a connection, freeing its group id.
    pub fn disconnect(&self, conn_id: ConnId) -> Option<PeerConnection> {
        self.lock().remove(conn_id)
    }

    /// Remove connections and signal their sessions to stop.
    pub fn evict(&self, conn_ids: &[ConnId]) -> Vec<PeerConnection> {
        let evicted: Vec<PeerConnection> = {
            let mut state = self.lock();
            conn_ids.iter().filter_map(|id| state.remove(*id)).collect()
        };
        for conn in &evicted {
            conn.link.close();
        }
        evicted
    }

    /// Evict every connection silent for longer than `window` as of `now`.
    pub fn evict_stale(&self, now: Instant, window: Duration) -> Vec<PeerConnection> {
        let stale: Vec<ConnId> = self
            .lock()
            .connections
            .values()
            .filter(|c| now.saturating_duration_since(c.last_seen) > window)
            .map(PeerConnection::conn_id)
            .collect();
        self.evict(&stale)
    }

    pub fn touch(&self, conn_id: ConnId) {
        if let Some(conn) = self.lock().connections.get_mut(&conn_id) {
            conn.last_seen = Instant::now();
        }
    }

    pub fn set_listen_port(&self, conn_id: ConnId, port: u16) {
        if let Some(conn) = self.lock().connections.get_mut(&conn_id) {
            conn.port = port;
        }
    }

    /// Bound group id of a connection, if any.
    pub fn group_of(&self, conn_id: ConnId) -> Option<String> {
        self.lock()
            .connections
            .get(&conn_id)
            .filter(|c| c.is_bound())
            .map(|c| c.group_id.clone())
    }

    pub fn lookup_by_group(&self, group_id: &str) -> Option<PeerLink> {
        self.lock()
            .connections
            .values()
            .find(|c| c.is_bound() && c.group_id == group_id)
            .map(|c| c.link.clone())
    }

    /// `(group, link)` for every id-bound connection.
    pub fn bound_peers(&self) -> Vec<(String, PeerLink)> {
        self.lock()
            .connections
            .values()
            .filter(|c| c.is_bound())
            .map(|c| (c.group_id.clone(), c.link.clone()))
            .collect()
    }

    pub fn connections(&self) -> Vec<PeerConnection> {
        self.lock().connections.values().cloned().collect()
    }

    /// Self first, then every bound peer with a known listen port.
    pub fn servers_view(&self, exclude: Option<ConnId>) -> Vec<ServerEntry> {
        let state = self.lock();
        let mut view = vec![self.local.as_entry()];
        view.extend(
            state
                .connections
                .values()
                .filter(|c| Some(c.conn_id()) != exclude)
                .filter(|c| c.is_bound() && c.port != 0)
                .map(|c| ServerEntry::new(&c.group_id, &c.ip, c.port)),
        );
        view
    }

    // --- known peers ---

    /// Merge gossip into the known-peer cache. Returns how many were upserted.
    pub fn upsert_known(&self, entries: &[ServerEntry]) -> usize {
        let mut state = self.lock();
        let now = Utc::now();
        let mut merged = 0;
        for entry in entries {
            if entry.group_id == self.local.group_id || state.group_ids.contains(&entry.group_id) {
                continue;
            }
            state.known.insert(
                entry.group_id.clone(),
                KnownPeer {
                    group_id: entry.group_id.clone(),
                    ip: entry.ip.clone(),
                    port: entry.port,
                    last_heard: now,
                },
            );
            merged += 1;
        }
        merged
    }

    pub fn known_peers(&self) -> Vec<KnownPeer> {
        self.lock().known.values().cloned().collect()
    }

    /// Record a HELO attempt unless one was made within `cooldown`.
    pub fn should_attempt_helo(&self, group_id: &str, now: Instant, cooldown: Duration) -> bool {
        let mut state = self.lock();
        if let Some(last) = state.helo_attempts.get(group_id) {
            if now.saturating_duration_since(*last) < cooldown {
                return false;
            }
        }
        state.helo_attempts.insert(group_id.to_string(), now);
        true
    }

    // --- discovery guard ---

    /// Claim the single discovery slot. `None` if a scan is already running.
    pub fn try_begin_scan(&self) -> Option<ScanGuard> {
        let mut state = self.lock();
        if state.scanning {
            return None;
        }
        state.scanning = true;
        Some(ScanGuard {
            state: Arc::clone(&self.state),
        })
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    // --- message store ---

    pub fn enqueue(&self, message: QueuedMessage) {
        self.lock().store.push(message);
    }

    pub fn pop_message(&self, group_id: &str) -> Option<QueuedMessage> {
        self.lock().store.pop(group_id)
    }

    pub fn queue_len(&self, group_id: &str) -> usize {
        self.lock().store.len(group_id)
    }

    pub fn queue_summary(&self) -> Vec<(String, usize)> {
        self.lock().store.summary()
    }

    pub fn queued_total(&self) -> usize {
        self.lock().store.total()
    }

    // --- counters ---

    pub fn record_received(&self) {
        self.lock().counters.received += 1;
    }

    pub fn record_sent(&self) {
        self.lock().counters.sent += 1;
    }

    pub fn record_forwarded(&self) {
        self.lock().counters.forwarded += 1;
    }

    /// Count a dropped loop; returns the new total.
    pub fn record_loop(&self) -> u64 {
        let mut state = self.lock();
        state.counters.loops_detected += 1;
        state.counters.loops_detected
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }
}

/// Releases the discovery slot when dropped.
#[derive(Debug)]
pub struct ScanGuard {
    state: Arc<Mutex<RegistryState>>,
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).scanning = false;
    }
}
