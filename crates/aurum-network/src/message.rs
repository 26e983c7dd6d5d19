//! Sync protocol messages.

use crate::{NetworkError, NetworkResult};
use aurum_chain::{Block, BlockHeader, Hash, HASH_LENGTH};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum encoded message length.
pub const MAX_MESSAGE_LENGTH: usize = 8 * 1024 * 1024;

/// Message kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    /// Header range request.
    GetBlockHeaders = 8,
    /// Ordered header sequence.
    BlockHeaders = 9,
    /// Block range request.
    GetBlocks = 10,
    /// Advisory block heights, sent ahead of `Blocks`.
    BlocksPre = 11,
    /// Ordered block sequence.
    Blocks = 12,
}

impl TryFrom<u16> for MessageKind {
    type Error = NetworkError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            8 => Ok(MessageKind::GetBlockHeaders),
            9 => Ok(MessageKind::BlockHeaders),
            10 => Ok(MessageKind::GetBlocks),
            11 => Ok(MessageKind::BlocksPre),
            12 => Ok(MessageKind::Blocks),
            _ => Err(NetworkError::InvalidMessage(format!(
                "Unknown message code: {}",
                value
            ))),
        }
    }
}

/// Start of a range request, addressed by hash or by height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    /// Start at the block with this hash.
    Hash(Hash),
    /// Start at this height.
    Number(u64),
}

impl HashOrNumber {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            HashOrNumber::Hash(hash) => {
                buf.put_u8(0);
                buf.put_slice(&hash.0);
            }
            HashOrNumber::Number(number) => {
                buf.put_u8(1);
                buf.put_u64(*number);
            }
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> NetworkResult<Self> {
        if !buf.has_remaining() {
            return Err(NetworkError::InvalidMessage("Truncated range start".into()));
        }
        match buf.get_u8() {
            0 => {
                if buf.remaining() < HASH_LENGTH {
                    return Err(NetworkError::InvalidMessage("Truncated start hash".into()));
                }
                let mut bytes = [0u8; HASH_LENGTH];
                buf.copy_to_slice(&mut bytes);
                Ok(HashOrNumber::Hash(Hash(bytes)))
            }
            1 => {
                if buf.remaining() < 8 {
                    return Err(NetworkError::InvalidMessage("Truncated start height".into()));
                }
                Ok(HashOrNumber::Number(buf.get_u64()))
            }
            tag => Err(NetworkError::InvalidMessage(format!(
                "Unknown range start tag: {}",
                tag
            ))),
        }
    }
}

/// Header range request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockHeaders {
    /// Where the range starts.
    pub start: HashOrNumber,
    /// Number of headers requested.
    pub count: u32,
    /// Walk towards lower heights when set.
    pub reverse: bool,
}

/// Block range request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlocks {
    /// Where the range starts.
    pub start: HashOrNumber,
    /// Number of blocks requested.
    pub count: u32,
}

/// A sync protocol message.
#[derive(Debug, Clone)]
pub enum Message {
    /// Header range request.
    GetBlockHeaders(GetBlockHeaders),
    /// Ordered header sequence.
    BlockHeaders(Vec<BlockHeader>),
    /// Block range request.
    GetBlocks(GetBlocks),
    /// Advisory heights for an upcoming `Blocks` message.
    BlocksPre(Vec<u64>),
    /// Ordered block sequence.
    Blocks(Vec<Block>),
}

impl Message {
    /// The kind identifier of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::GetBlockHeaders(_) => MessageKind::GetBlockHeaders,
            Message::BlockHeaders(_) => MessageKind::BlockHeaders,
            Message::GetBlocks(_) => MessageKind::GetBlocks,
            Message::BlocksPre(_) => MessageKind::BlocksPre,
            Message::Blocks(_) => MessageKind::Blocks,
        }
    }

    /// Encode to wire bytes: u16 code followed by the payload.
    pub fn encode(&self) -> NetworkResult<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u16(self.kind() as u16);

        match self {
            Message::GetBlockHeaders(req) => {
                req.start.encode(&mut buf);
                buf.put_u32(req.count);
                buf.put_u8(req.reverse as u8);
            }
            Message::BlockHeaders(headers) => {
                buf.put_u32(headers.len() as u32);
                for header in headers {
                    header.encode(&mut buf);
                }
            }
            Message::GetBlocks(req) => {
                req.start.encode(&mut buf);
                buf.put_u32(req.count);
            }
            Message::BlocksPre(heights) => {
                buf.put_u32(heights.len() as u32);
                for height in heights {
                    buf.put_u64(*height);
                }
            }
            Message::Blocks(blocks) => {
                buf.put_u32(blocks.len() as u32);
                for block in blocks {
                    block.encode(&mut buf);
                }
            }
        }

        if buf.len() > MAX_MESSAGE_LENGTH {
            return Err(NetworkError::MessageTooLarge {
                size: buf.len(),
                max: MAX_MESSAGE_LENGTH,
            });
        }
        Ok(buf.freeze())
    }

    /// Decode from wire bytes.
    pub fn decode(mut buf: Bytes) -> NetworkResult<Message> {
        if buf.len() > MAX_MESSAGE_LENGTH {
            return Err(NetworkError::MessageTooLarge {
                size: buf.len(),
                max: MAX_MESSAGE_LENGTH,
            });
        }
        if buf.remaining() < 2 {
            return Err(NetworkError::InvalidMessage("Missing message code".into()));
        }
        let kind = MessageKind::try_from(buf.get_u16())?;

        match kind {
            MessageKind::GetBlockHeaders => {
                let start = HashOrNumber::decode(&mut buf)?;
                if buf.remaining() < 5 {
                    return Err(NetworkError::InvalidMessage(
                        "Truncated header request".into(),
                    ));
                }
                let count = buf.get_u32();
                let reverse = buf.get_u8() != 0;
                Ok(Message::GetBlockHeaders(GetBlockHeaders {
                    start,
                    count,
                    reverse,
                }))
            }
            MessageKind::BlockHeaders => {
                let count = decode_count(&mut buf)?;
                let mut headers = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let header = BlockHeader::decode(&mut buf)
                        .map_err(|e| NetworkError::InvalidMessage(e.to_string()))?;
                    headers.push(header);
                }
                Ok(Message::BlockHeaders(headers))
            }
            MessageKind::GetBlocks => {
                let start = HashOrNumber::decode(&mut buf)?;
                if buf.remaining() < 4 {
                    return Err(NetworkError::InvalidMessage(
                        "Truncated block request".into(),
                    ));
                }
                Ok(Message::GetBlocks(GetBlocks {
                    start,
                    count: buf.get_u32(),
                }))
            }
            MessageKind::BlocksPre => {
                let count = decode_count(&mut buf)?;
                if buf.remaining() < count * 8 {
                    return Err(NetworkError::InvalidMessage(
                        "Truncated height list".into(),
                    ));
                }
                let heights = (0..count).map(|_| buf.get_u64()).collect();
                Ok(Message::BlocksPre(heights))
            }
            MessageKind::Blocks => {
                let count = decode_count(&mut buf)?;
                let mut blocks = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let block = Block::decode(&mut buf)
                        .map_err(|e| NetworkError::InvalidMessage(e.to_string()))?;
                    blocks.push(block);
                }
                Ok(Message::Blocks(blocks))
            }
        }
    }
}

fn decode_count<B: Buf>(buf: &mut B) -> NetworkResult<usize> {
    if buf.remaining() < 4 {
        return Err(NetworkError::InvalidMessage("Truncated item count".into()));
    }
    Ok(buf.get_u32() as usize)
}
