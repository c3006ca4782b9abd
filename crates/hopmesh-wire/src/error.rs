//! Errors from the wire layer.

use hopmesh_types::error::HopmeshError;
use thiserror::Error;

/// Errors raised while framing, handshaking or talking to a peer.
///
/// Every variant except [`WireError::Rejected`] means the connection it came
/// from is unusable and must be closed.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Bad frame marker: expected 0x{expected:02x}, got 0x{got:02x}")]
    BadMarker { expected: u8, got: u8 },
    #[error("Invalid frame length: {0}")]
    InvalidLength(usize),
    #[error("Truncated frame")]
    Truncated,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Peer rejected: {0}")]
    Rejected(#[from] HopmeshError),
}

/// Alias for wire results.
pub type WireResult<T> = Result<T, WireError>;
