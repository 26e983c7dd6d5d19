//! Sync error types.

use aurum_network::PeerId;
use thiserror::Error;

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A sync session is already active.
    #[error("Already synchronising")]
    Busy,

    /// The named master peer is not registered.
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    /// A header did not hash to the expected value.
    #[error("Hash not match")]
    HashMismatch,

    /// Wrong payload shape for the message kind.
    #[error("Invalid packet received")]
    InvalidPacket,

    /// Empty headers response during the ancestor walk.
    #[error("Ancestor is invalid")]
    InvalidAncestor,

    /// No common ancestor within the fork ancestry limit.
    #[error("Can not find ancestor when reached max fork ancestry")]
    ForkTooDeep,

    /// The session ended before every slot was processed.
    #[error("Err occurs when syncing")]
    SyncAborted,

    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] aurum_network::NetworkError),

    /// Chain error.
    #[error("Chain error: {0}")]
    Chain(#[from] aurum_chain::ChainError),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
