//! Kernel-specific error types.

use hopmesh_types::error::HopmeshError;
use thiserror::Error;

/// Kernel error type wrapping HopmeshError with kernel-specific context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped HopmeshError.
    #[error(transparent)]
    Hopmesh(#[from] HopmeshError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),

    /// The accept loop ended while serving.
    #[error("Listener stopped: {0}")]
    ListenerStopped(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
