//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The session cancellation signal fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// The peer connection was closed.
    #[error("Peer gone")]
    PeerGone,

    /// Malformed or unexpected message payload.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Encoded message exceeds the protocol limit.
    #[error("Message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// An outbound send could not be issued.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
