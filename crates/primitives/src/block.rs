//! Block header and block types.

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;
use crate::Hash256;

pub const HEADER_LEN: usize = 80;
const MAX_BLOCK_TXS: u64 = 1_000_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> [u8; HEADER_LEN] {
        let mut encoder = Encoder::with_capacity(HEADER_LEN);
        Encodable::consensus_encode(self, &mut encoder);
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&encoder.into_inner());
        out
    }

    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        Encodable::consensus_encode(&self.header, &mut encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            Encodable::consensus_encode(tx, &mut encoder);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        ParsedBlock::parse(bytes).map(ParsedBlock::into_block)
    }
}

/// A decoded block that remembers where each transaction sits in the raw
/// buffer and what its txid is.
#[derive(Clone, Debug)]
pub struct ParsedBlock {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub transactions: Vec<Transaction>,
    pub txids: Vec<Hash256>,
    pub tx_offsets: Vec<u32>,
}

impl ParsedBlock {
    pub fn parse(bytes: &[u8]) -> Result<Self, BlockDecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        let count = decoder.read_varint()?;
        if count == 0 {
            return Err(BlockDecodeError::Empty);
        }
        if count > MAX_BLOCK_TXS {
            return Err(BlockDecodeError::Decode(DecodeError::SizeTooLarge));
        }
        let count = count as usize;
        let mut transactions = Vec::with_capacity(count);
        let mut txids = Vec::with_capacity(count);
        let mut tx_offsets = Vec::with_capacity(count);
        for _ in 0..count {
            let start = decoder.position();
            let tx = Transaction::consensus_decode(&mut decoder)?;
            let end = decoder.position();
            let offset = u32::try_from(start).map_err(|_| DecodeError::SizeTooLarge)?;
            txids.push(sha256d(&bytes[start..end]));
            tx_offsets.push(offset);
            transactions.push(tx);
        }
        if !decoder.is_empty() {
            return Err(BlockDecodeError::Decode(DecodeError::TrailingBytes));
        }
        Ok(Self {
            hash: header.hash(),
            header,
            transactions,
            txids,
            tx_offsets,
        })
    }

    pub fn into_block(self) -> Block {
        Block {
            header: self.header,
            transactions: self.transactions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockDecodeError {
    Decode(DecodeError),
    Empty,
}

impl From<DecodeError> for BlockDecodeError {
    fn from(error: DecodeError) -> Self {
        BlockDecodeError::Decode(error)
    }
}

impl std::fmt::Display for BlockDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockDecodeError::Decode(error) => write!(f, "{error}"),
            BlockDecodeError::Empty => write!(f, "block has no transactions"),
        }
    }
}

impl std::error::Error for BlockDecodeError {}
