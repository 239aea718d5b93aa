//! Per-height block records, undo records and the scanned-tip marker.

use utxoscan_primitives::block::HEADER_LEN;
use utxoscan_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use utxoscan_primitives::{merkle_root, BlockHeader, Hash256};
use utxoscan_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockfiles::FileLocation;
use crate::error::corrupt_record;
use crate::history::HistoryEvent;

const META_TOP_KEY: &[u8] = b"scan_top";
const META_BASE_KEY: &[u8] = b"scan_base";
const MAX_RECORD_ITEMS: u64 = 1_000_000;

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

/// What the scanner saw of a committed block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockRecord {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub location: FileLocation,
    pub txids: Vec<Hash256>,
}

impl BlockRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(32 + HEADER_LEN + 16 + 1 + self.txids.len() * 32);
        encoder.write_hash_le(&self.hash);
        Encodable::consensus_encode(&self.header, &mut encoder);
        encoder.write_bytes(&self.location.encode());
        encoder.write_varint(self.txids.len() as u64);
        for txid in &self.txids {
            encoder.write_hash_le(txid);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let hash = decoder.read_hash_le()?;
        let header = BlockHeader::consensus_decode(&mut decoder)?;
        let location = FileLocation::decode(decoder.read_slice(16)?)
            .ok_or(DecodeError::InvalidData("invalid block location"))?;
        let count = decoder.read_varint()?;
        if count > MAX_RECORD_ITEMS {
            return Err(DecodeError::SizeTooLarge);
        }
        let mut txids = Vec::with_capacity(count as usize);
        for _ in 0..count {
            txids.push(decoder.read_hash_le()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash,
            header,
            location,
            txids,
        })
    }

    /// Whether the stored txids and hash still agree with the stored header.
    pub fn is_consistent(&self) -> bool {
        self.header.hash() == self.hash && merkle_root(&self.txids) == self.header.merkle_root
    }
}

/// Tracked events of one committed block in chain order; replayed backwards to
/// undo the block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockUndo {
    pub hash: Hash256,
    pub events: Vec<HistoryEvent>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash_le(&self.hash);
        encoder.write_varint(self.events.len() as u64);
        for event in &self.events {
            event.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let hash = decoder.read_hash_le()?;
        let count = decoder.read_varint()?;
        if count > MAX_RECORD_ITEMS {
            return Err(DecodeError::SizeTooLarge);
        }
        let mut events = Vec::with_capacity(count as usize);
        for _ in 0..count {
            events.push(HistoryEvent::decode_from(&mut decoder)?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { hash, events })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanTip {
    pub height: u32,
    pub hash: Hash256,
}

impl ScanTip {
    fn encode(&self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..4].copy_from_slice(&self.height.to_le_bytes());
        out[4..].copy_from_slice(&self.hash);
        out
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 36 {
            return None;
        }
        Some(Self {
            height: u32::from_le_bytes(bytes[..4].try_into().ok()?),
            hash: bytes[4..].try_into().ok()?,
        })
    }
}

pub struct BlockDataIndex<S> {
    store: S,
}

impl<S> BlockDataIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> BlockDataIndex<S> {
    pub fn put_record(&self, batch: &mut WriteBatch, height: u32, record: &BlockRecord) {
        batch.put(Column::BlockData, height_key(height), record.encode());
    }

    pub fn delete_record(&self, batch: &mut WriteBatch, height: u32) {
        batch.delete(Column::BlockData, height_key(height));
    }

    pub fn record(&self, height: u32) -> Result<Option<BlockRecord>, StoreError> {
        match self.store.get(Column::BlockData, &height_key(height))? {
            Some(bytes) => Ok(Some(
                BlockRecord::decode(&bytes).map_err(|err| corrupt_record("block data", err))?,
            )),
            None => Ok(None),
        }
    }

    pub fn put_undo(&self, batch: &mut WriteBatch, height: u32, undo: &BlockUndo) {
        batch.put(Column::BlockUndo, height_key(height), undo.encode());
    }

    pub fn delete_undo(&self, batch: &mut WriteBatch, height: u32) {
        batch.delete(Column::BlockUndo, height_key(height));
    }

    pub fn undo(&self, height: u32) -> Result<Option<BlockUndo>, StoreError> {
        match self.store.get(Column::BlockUndo, &height_key(height))? {
            Some(bytes) => Ok(Some(
                BlockUndo::decode(&bytes).map_err(|err| corrupt_record("block undo", err))?,
            )),
            None => Ok(None),
        }
    }

    pub fn top(&self) -> Result<Option<ScanTip>, StoreError> {
        let bytes = match self.store.get(Column::Meta, META_TOP_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        ScanTip::decode(&bytes)
            .ok_or_else(|| StoreError::Backend("invalid scan top entry".to_string()))
            .map(Some)
    }

    pub fn set_top(&self, batch: &mut WriteBatch, tip: Option<ScanTip>) {
        match tip {
            Some(tip) => batch.put(Column::Meta, META_TOP_KEY, tip.encode()),
            None => batch.delete(Column::Meta, META_TOP_KEY),
        }
    }
}

impl<S: KeyValueStore> BlockDataIndex<S> {
    /// Lowest committed height; records exist for every height from here to the top.
    pub fn base(&self) -> Result<Option<u32>, StoreError> {
        let bytes = match self.store.get(Column::Meta, META_BASE_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let raw: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Backend("invalid scan base entry".to_string()))?;
        Ok(Some(u32::from_le_bytes(raw)))
    }

    pub fn set_base(&self, batch: &mut WriteBatch, base: Option<u32>) {
        match base {
            Some(height) => batch.put(Column::Meta, META_BASE_KEY, height.to_le_bytes()),
            None => batch.delete(Column::Meta, META_BASE_KEY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use utxoscan_storage::memory::MemoryStore;

    fn record(txids: Vec<Hash256>) -> BlockRecord {
        let header = BlockHeader {
            version: 4,
            prev_block: [1; 32],
            merkle_root: merkle_root(&txids),
            time: 7,
            bits: 0x1d00_ffff,
            nonce: 3,
        };
        BlockRecord {
            hash: header.hash(),
            header,
            location: FileLocation {
                file_id: 2,
                offset: 40,
                len: 300,
            },
            txids,
        }
    }

    #[test]
    fn consistency_tracks_txids() {
        let mut rec = record(vec![[3; 32], [4; 32]]);
        assert!(rec.is_consistent());
        let decoded = BlockRecord::decode(&rec.encode()).expect("decode");
        assert_eq!(decoded, rec);
        rec.txids.swap(0, 1);
        assert!(!rec.is_consistent());
    }

    #[test]
    fn top_marker_can_be_cleared() {
        let store = Arc::new(MemoryStore::new());
        let index = BlockDataIndex::new(Arc::clone(&store));
        assert_eq!(index.top().expect("top"), None);
        let tip = ScanTip {
            height: 12,
            hash: [5; 32],
        };
        let mut batch = WriteBatch::new();
        index.set_top(&mut batch, Some(tip));
        index.put_record(&mut batch, 12, &record(vec![[9; 32]]));
        store.write_batch(&batch).expect("write");
        assert_eq!(index.top().expect("top"), Some(tip));
        assert!(index.record(12).expect("record").is_some());

        let mut batch = WriteBatch::new();
        index.set_top(&mut batch, None);
        index.delete_record(&mut batch, 12);
        store.write_batch(&batch).expect("write");
        assert_eq!(index.top().expect("top"), None);
        assert_eq!(index.record(12).expect("record"), None);
    }
}
