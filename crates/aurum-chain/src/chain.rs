//! In-memory chain store.

use crate::{Block, ChainError, ChainResult, Hash};
use parking_lot::RwLock;
use tracing::{debug, warn};

/// The chain-writer interface consumed by the sync engine.
///
/// `write_block` returning [`ChainError::AlreadyExists`] is not fatal to
/// callers; every other error is.
pub trait ChainStore: Send + Sync {
    /// The current head block.
    fn current_block(&self) -> Block;

    /// Hash of the block at `height`, if one exists.
    fn get_block_hash(&self, height: u64) -> Option<Hash>;

    /// Append a block, overwriting the tail when a fork block arrives at or
    /// below the current head.
    fn write_block(&self, block: &Block) -> ChainResult<()>;
}

/// An in-memory block chain indexed by height.
///
/// Durable persistence is a concern of the surrounding node; the store keeps
/// the linear chain from genesis and supports tail overwrite for
/// reorganisations.
pub struct Blockchain {
    blocks: RwLock<Vec<Block>>,
}

impl Blockchain {
    /// Create a chain seeded with the given genesis block.
    pub fn new(genesis: Block) -> Self {
        Self {
            blocks: RwLock::new(vec![genesis]),
        }
    }

    /// Current head height.
    pub fn height(&self) -> u64 {
        self.blocks.read().len() as u64 - 1
    }

    /// Fetch a full block by height.
    pub fn get_block(&self, height: u64) -> Option<Block> {
        self.blocks.read().get(height as usize).cloned()
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new(Block::genesis())
    }
}

impl ChainStore for Blockchain {
    fn current_block(&self) -> Block {
        self.blocks
            .read()
            .last()
            .cloned()
            .expect("chain always holds genesis")
    }

    fn get_block_hash(&self, height: u64) -> Option<Hash> {
        self.blocks
            .read()
            .get(height as usize)
            .map(|b| b.header.hash())
    }

    fn write_block(&self, block: &Block) -> ChainResult<()> {
        let mut blocks = self.blocks.write();
        let head = blocks.len() as u64 - 1;
        let height = block.header.height;

        if height == 0 {
            return Err(ChainError::InvalidBlock("Genesis is fixed".into()));
        }
        if height > head + 1 {
            return Err(ChainError::InvalidBlock(format!(
                "Height {} leaves a gap above head {}",
                height, head
            )));
        }

        let parent = &blocks[(height - 1) as usize];
        if parent.header.hash() != block.header.parent_hash {
            return Err(ChainError::InvalidBlock(format!(
                "Parent hash mismatch at height {}",
                height
            )));
        }

        if height <= head {
            if blocks[height as usize].header.hash() == block.header.hash() {
                return Err(ChainError::AlreadyExists);
            }
            // Fork block below the head: drop the old tail.
            warn!(
                height,
                old_head = head,
                "Overwriting chain tail with fork block"
            );
            blocks.truncate(height as usize);
        }

        debug!(height, hash = %block.hash(), "Block written");
        blocks.push(block.clone());
        Ok(())
    }
}
