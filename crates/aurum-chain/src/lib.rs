//! # aurum-chain
//!
//! Block types and chain storage for the Aurum ledger.
//!
//! This crate provides:
//! - Content-addressed block headers and blocks
//! - Canonical binary encoding used for hashing and the wire
//! - The chain-writer interface consumed by the sync engine
//! - An in-memory chain store with fork-tail overwrite

mod block;
mod chain;
mod error;

pub use block::{blake2b256, Block, BlockHeader, Hash, Transaction};
pub use chain::{Blockchain, ChainStore};
pub use error::{ChainError, ChainResult};

/// Size of a content hash in bytes.
pub const HASH_LENGTH: usize = 32;
