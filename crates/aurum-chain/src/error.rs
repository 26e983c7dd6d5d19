//! Chain error types.

use thiserror::Error;

/// Chain errors.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Block is already part of the chain.
    #[error("Block already exists")]
    AlreadyExists,

    /// No block at the requested height.
    #[error("Block not found at height {0}")]
    NotFound(u64),

    /// Block cannot be linked to the chain.
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    /// Malformed binary encoding.
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
