//! Block and header types with canonical encoding.

use crate::{ChainError, ChainResult, HASH_LENGTH};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use bytes::{Buf, BufMut};

/// Compute the Blake2b-256 hash of a byte slice.
pub fn blake2b256(data: &[u8]) -> Hash {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// A 32-byte content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; HASH_LENGTH]);

impl Hash {
    /// The all-zero hash.
    pub const ZERO: Hash = Hash([0u8; HASH_LENGTH]);

    /// Access the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Hash(bytes)
    }
}

/// A block header.
///
/// The sync engine only relies on `height` and `hash()`; the remaining fields
/// exist so the header is a real content-addressed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Height of the block in the chain.
    pub height: u64,
    /// Hash of the parent header.
    pub parent_hash: Hash,
    /// State commitment after applying the block.
    pub state_root: Hash,
    /// Creation time in unix milliseconds.
    pub timestamp: u64,
    /// Proof-of-work difficulty of this block.
    pub difficulty: u64,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

/// Encoded header size: three u64 pairs plus two hashes.
const HEADER_ENCODED_LEN: usize = 8 + HASH_LENGTH + HASH_LENGTH + 8 + 8 + 8;

impl BlockHeader {
    /// Compute the content hash of this header.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(HEADER_ENCODED_LEN);
        self.encode(&mut buf);
        blake2b256(&buf)
    }

    /// Append the canonical encoding to a buffer.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.height);
        buf.put_slice(&self.parent_hash.0);
        buf.put_slice(&self.state_root.0);
        buf.put_u64(self.timestamp);
        buf.put_u64(self.difficulty);
        buf.put_u64(self.nonce);
    }

    /// Decode a header from the front of a buffer.
    pub fn decode<B: Buf>(buf: &mut B) -> ChainResult<Self> {
        if buf.remaining() < HEADER_ENCODED_LEN {
            return Err(ChainError::Decode("Truncated header".into()));
        }
        let height = buf.get_u64();
        let mut parent_hash = [0u8; HASH_LENGTH];
        buf.copy_to_slice(&mut parent_hash);
        let mut state_root = [0u8; HASH_LENGTH];
        buf.copy_to_slice(&mut state_root);
        Ok(Self {
            height,
            parent_hash: Hash(parent_hash),
            state_root: Hash(state_root),
            timestamp: buf.get_u64(),
            difficulty: buf.get_u64(),
            nonce: buf.get_u64(),
        })
    }
}

/// A transaction. The sync engine treats the payload as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Serialized transaction payload.
    pub data: Vec<u8>,
}

impl Transaction {
    /// Create a transaction from its payload.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Compute the content hash of this transaction.
    pub fn hash(&self) -> Hash {
        blake2b256(&self.data)
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    fn decode<B: Buf>(buf: &mut B) -> ChainResult<Self> {
        if buf.remaining() < 4 {
            return Err(ChainError::Decode("Truncated transaction".into()));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(ChainError::Decode("Truncated transaction payload".into()));
        }
        let mut data = vec![0u8; len];
        buf.copy_to_slice(&mut data);
        Ok(Self { data })
    }
}

/// A full block: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// The block header.
    pub header: BlockHeader,
    /// The block body.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a block.
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// The fixed genesis block at height 0.
    pub fn genesis() -> Self {
        Self {
            header: BlockHeader {
                height: 0,
                parent_hash: Hash::ZERO,
                state_root: Hash::ZERO,
                timestamp: 0,
                difficulty: 1,
                nonce: 0,
            },
            transactions: Vec::new(),
        }
    }

    /// Content hash of the block (the header hash).
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Append the canonical encoding to a buffer.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        buf.put_u32(self.transactions.len() as u32);
        for tx in &self.transactions {
            tx.encode(buf);
        }
    }

    /// Decode a block from the front of a buffer.
    pub fn decode<B: Buf>(buf: &mut B) -> ChainResult<Self> {
        let header = BlockHeader::decode(buf)?;
        if buf.remaining() < 4 {
            return Err(ChainError::Decode("Truncated block body".into()));
        }
        let count = buf.get_u32() as usize;
        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            transactions.push(Transaction::decode(buf)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}
