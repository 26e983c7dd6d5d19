//! # aurum-network
//!
//! Peer plumbing for the Aurum ledger.
//!
//! This crate provides:
//! - The typed sync protocol messages and their binary codec
//! - The peer capability trait used to issue requests
//! - The per-peer connection with kind-demultiplexed inbound delivery

mod connection;
mod error;
mod message;
mod peer;

pub use connection::PeerConnection;
pub use error::{NetworkError, NetworkResult};
pub use message::{
    GetBlockHeaders, GetBlocks, HashOrNumber, Message, MessageKind, MAX_MESSAGE_LENGTH,
};
pub use peer::{Peer, PeerId, TotalDifficulty};
