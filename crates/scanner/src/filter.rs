//! Per-block transaction filters: a 4-byte txid prefix and the byte offset of
//! every transaction, stored in transaction order.

use std::collections::BTreeMap;

use utxoscan_primitives::encoding::{DecodeError, Decoder, Encoder};
use utxoscan_primitives::{Hash256, ParsedBlock};
use utxoscan_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockfiles::FileLocation;
use crate::error::corrupt_record;

const MAX_FILTER_ENTRIES: u64 = 1_000_000;

pub fn hash_prefix(hash: &Hash256) -> u32 {
    u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]])
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FilterEntry {
    pub prefix: u32,
    pub tx_offset: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockFilter {
    pub height: u32,
    pub hash: Hash256,
    pub location: FileLocation,
    pub entries: Vec<FilterEntry>,
}

impl BlockFilter {
    pub fn from_parsed(height: u32, location: FileLocation, block: &ParsedBlock) -> Self {
        let entries = block
            .txids
            .iter()
            .zip(&block.tx_offsets)
            .map(|(txid, offset)| FilterEntry {
                prefix: hash_prefix(txid),
                tx_offset: *offset,
            })
            .collect();
        Self {
            height,
            hash: block.hash,
            location,
            entries,
        }
    }

    /// (tx index, tx offset) of every entry whose prefix matches `hash`.
    pub fn candidates(&self, hash: &Hash256) -> impl Iterator<Item = (u32, u32)> + '_ {
        let prefix = hash_prefix(hash);
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, entry)| entry.prefix == prefix)
            .map(|(index, entry)| (index as u32, entry.tx_offset))
    }

    pub fn key(&self) -> [u8; 12] {
        filter_key(&self.location)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(32 + 16 + 5 + self.entries.len() * 8);
        encoder.write_u32_le(self.height);
        encoder.write_hash_le(&self.hash);
        encoder.write_bytes(&self.location.encode());
        encoder.write_varint(self.entries.len() as u64);
        for entry in &self.entries {
            encoder.write_u32_le(entry.prefix);
            encoder.write_u32_le(entry.tx_offset);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = decoder.read_u32_le()?;
        let hash = decoder.read_hash_le()?;
        let location = FileLocation::decode(decoder.read_slice(16)?)
            .ok_or(DecodeError::InvalidData("invalid filter location"))?;
        let count = decoder.read_varint()?;
        if count > MAX_FILTER_ENTRIES {
            return Err(DecodeError::SizeTooLarge);
        }
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(FilterEntry {
                prefix: decoder.read_u32_le()?,
                tx_offset: decoder.read_u32_le()?,
            });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            height,
            hash,
            location,
            entries,
        })
    }
}

pub fn filter_key(location: &FileLocation) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&location.file_id.to_be_bytes());
    key[4..].copy_from_slice(&location.offset.to_be_bytes());
    key
}

pub struct TxFilterIndex<S> {
    store: S,
}

impl<S> TxFilterIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> TxFilterIndex<S> {
    pub fn insert(&self, batch: &mut WriteBatch, filter: &BlockFilter) {
        batch.put(Column::TxFilter, filter.key(), filter.encode());
    }

    pub fn get(&self, location: &FileLocation) -> Result<Option<BlockFilter>, StoreError> {
        match self.store.get(Column::TxFilter, &filter_key(location))? {
            Some(bytes) => Ok(Some(
                BlockFilter::decode(&bytes).map_err(|err| corrupt_record("tx filter", err))?,
            )),
            None => Ok(None),
        }
    }

    /// Every stored filter grouped by block file, in file offset order.
    pub fn by_file(&self) -> Result<BTreeMap<u32, Vec<BlockFilter>>, StoreError> {
        let mut files: BTreeMap<u32, Vec<BlockFilter>> = BTreeMap::new();
        self.store
            .for_each_prefix(Column::TxFilter, &[], &mut |_key: &[u8], value: &[u8]| {
                let filter =
                    BlockFilter::decode(value).map_err(|err| corrupt_record("tx filter", err))?;
                files.entry(filter.location.file_id).or_default().push(filter);
                Ok(())
            })?;
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_match_prefix_only() {
        let mut target = [0u8; 32];
        target[..4].copy_from_slice(&[1, 2, 3, 4]);
        let filter = BlockFilter {
            height: 3,
            hash: [8; 32],
            location: FileLocation {
                file_id: 0,
                offset: 0,
                len: 10,
            },
            entries: vec![
                FilterEntry {
                    prefix: hash_prefix(&target),
                    tx_offset: 81,
                },
                FilterEntry {
                    prefix: 7,
                    tx_offset: 150,
                },
                FilterEntry {
                    prefix: hash_prefix(&target),
                    tx_offset: 220,
                },
            ],
        };
        let hits: Vec<_> = filter.candidates(&target).collect();
        assert_eq!(hits, vec![(0, 81), (2, 220)]);
        assert_eq!(BlockFilter::decode(&filter.encode()).expect("decode"), filter);
    }

    #[test]
    fn keys_order_by_file_then_offset() {
        let key = |file_id, offset| {
            filter_key(&FileLocation {
                file_id,
                offset,
                len: 1,
            })
        };
        assert!(key(0, 300) < key(1, 0));
        assert!(key(1, 0) < key(1, 1 << 20));
    }
}
