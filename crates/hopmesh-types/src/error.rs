//! Shared error types for the hopmesh system.

use thiserror::Error;

/// Top-level error type for the hopmesh system.
#[derive(Error, Debug)]
pub enum HopmeshError {
    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A peer announced this node's own group id.
    #[error("Self connection: peer claims our own group id {0}")]
    SelfConnection(String),

    /// A peer with this group id is already connected.
    #[error("Duplicate identity: {0} is already connected")]
    DuplicateIdentity(String),

    /// The connection table is full.
    #[error("Capacity exceeded: {current}/{max} connections")]
    CapacityExceeded {
        /// Live connections at the time of the attempt.
        current: usize,
        /// Configured maximum degree.
        max: usize,
    },

    /// A connection to this address already exists.
    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    /// No live connection has this id.
    #[error("Unknown connection: {0}")]
    UnknownConnection(u64),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid user input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Alias for Result with HopmeshError.
pub type HopmeshResult<T> = Result<T, HopmeshError>;
