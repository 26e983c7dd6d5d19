//! Deterministic chain generators for tests.

use aurum_chain::{blake2b256, Block, BlockHeader, Transaction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Build a deterministic transaction payload for a block.
fn transactions(height: u64, salt: u64) -> Vec<Transaction> {
    let mut rng = StdRng::seed_from_u64(height ^ salt.rotate_left(17));
    let count = rng.gen_range(0..4);
    (0..count)
        .map(|i| {
            let len = rng.gen_range(1..64);
            let mut data = vec![0u8; len];
            rng.fill(&mut data[..]);
            data.push(i as u8);
            Transaction::new(data)
        })
        .collect()
}

/// Extend `base` by `extra` linked blocks. `salt` varies the content so two
/// extensions of the same base diverge.
pub fn build_on(base: &[Block], extra: u64, salt: u64) -> Vec<Block> {
    let mut blocks = base.to_vec();
    for _ in 0..extra {
        let parent = blocks.last().expect("base chain is never empty");
        let height = parent.header.height + 1;
        let txs = transactions(height, salt);
        blocks.push(Block::new(
            BlockHeader {
                height,
                parent_hash: parent.header.hash(),
                state_root: blake2b256(&(height ^ salt).to_be_bytes()),
                timestamp: parent.header.timestamp + 10_000,
                difficulty: 1,
                nonce: salt,
            },
            txs,
        ));
    }
    blocks
}

/// A chain of `length` blocks on top of genesis.
pub fn chain(length: u64) -> Vec<Block> {
    build_on(&[Block::genesis()], length, 0)
}

/// Headers for heights `[from, to]` of a generated chain.
pub fn headers_of(blocks: &[Block], from: u64, to: u64) -> Vec<BlockHeader> {
    (from..=to)
        .map(|h| blocks[h as usize].header.clone())
        .collect()
}
