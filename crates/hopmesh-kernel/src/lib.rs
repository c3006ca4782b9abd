//! Core kernel for a hopmesh node.
//!
//! Wires the wire-layer [`PeerNode`](hopmesh_wire::peer::PeerNode) to the
//! [`Router`](router::Router), runs discovery at boot and keeps the peer set
//! healthy from one background task.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod kernel;
pub mod router;

pub use kernel::HopmeshKernel;
