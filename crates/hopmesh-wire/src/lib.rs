//! Hopmesh wire protocol — peer-to-peer store-and-forward messaging.
//!
//! Nodes exchange comma-separated commands inside SOH/STX/ETX frames over
//! TCP, discover each other through SERVERS gossip and port scanning, and
//! keep undelivered messages in per-destination queues.
//!
//! ## Architecture
//!
//! - **frame**: length-prefixed frame codec
//! - **command**: typed peer and client commands
//! - **PeerNode**: listener, outbound handshake and per-connection sessions
//! - **PeerRegistry**: connections, known peers, queues and counters under one lock
//! - **Discovery**: seeds, known-peer retries, rendezvous scanning
//! - **PeerHandle**: trait for routing commands through the kernel

pub mod command;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod link;
pub mod peer;
pub mod registry;
pub mod scanner;
pub mod store;

pub use command::{ClientCommand, Command, HopTrail, SendMsg, ServerEntry};
pub use discovery::{Discovery, ScanReport};
pub use error::{WireError, WireResult};
pub use link::{ConnId, PeerLink};
pub use peer::{PeerConfig, PeerHandle, PeerNode};
pub use registry::{Counters, Degree, LocalPeer, PeerRegistry};
pub use store::QueuedMessage;
