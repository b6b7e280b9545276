//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Address already in use
    #[error("address already in use: {0}")]
    AddressInUse(std::net::SocketAddr),

    /// No listen addresses were configured
    #[error("no listen sockets")]
    NoListenSockets,

    /// TAP device error
    #[error("TAP device error: {0}")]
    TapError(String),

    /// A control-channel frame exceeds the packet buffer
    #[error("control frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
