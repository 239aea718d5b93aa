//! Tracked unspent outputs and the per-address outpoint index.

use std::collections::HashMap;

use utxoscan_primitives::encoding::{DecodeError, Decoder, Encoder};
use utxoscan_primitives::outpoint::OUTPOINT_LEN;
use utxoscan_primitives::{Hash256, OutPoint};
use utxoscan_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::error::corrupt_record;

pub const ADDRESS_OUTPOINT_KEY_LEN: usize = 32 + OUTPOINT_LEN;

pub type UtxoMap = HashMap<OutPoint, TrackedOutput>;

/// An output paying a tracked address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrackedOutput {
    pub outpoint: OutPoint,
    pub script_hash: Hash256,
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub tx_index: u32,
}

impl TrackedOutput {
    pub(crate) fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.outpoint.hash);
        encoder.write_u32_le(self.outpoint.index);
        encoder.write_hash_le(&self.script_hash);
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u32_le(self.tx_index);
    }

    pub(crate) fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash_le()?;
        let index = decoder.read_u32_le()?;
        Ok(Self {
            outpoint: OutPoint { hash, index },
            script_hash: decoder.read_hash_le()?,
            value: decoder.read_i64_le()?,
            script_pubkey: decoder.read_var_bytes()?,
            height: decoder.read_u32_le()?,
            tx_index: decoder.read_u32_le()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let output = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(output)
    }
}

pub fn address_outpoint_key(script_hash: &Hash256, outpoint: &OutPoint) -> [u8; ADDRESS_OUTPOINT_KEY_LEN] {
    let mut key = [0u8; ADDRESS_OUTPOINT_KEY_LEN];
    key[..32].copy_from_slice(script_hash);
    key[32..].copy_from_slice(&outpoint.key());
    key
}

pub struct UtxoIndex<S> {
    store: S,
}

impl<S> UtxoIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoIndex<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<TrackedOutput>, StoreError> {
        match self.store.get(Column::Utxo, &outpoint.key())? {
            Some(bytes) => Ok(Some(
                TrackedOutput::decode(&bytes).map_err(|err| corrupt_record("utxo", err))?,
            )),
            None => Ok(None),
        }
    }

    pub fn insert(&self, batch: &mut WriteBatch, output: &TrackedOutput) {
        batch.put(Column::Utxo, output.outpoint.key(), output.encode());
        batch.put(
            Column::AddressOutpoint,
            address_outpoint_key(&output.script_hash, &output.outpoint),
            Vec::new(),
        );
    }

    pub fn remove(&self, batch: &mut WriteBatch, output: &TrackedOutput) {
        batch.delete(Column::Utxo, output.outpoint.key());
        batch.delete(
            Column::AddressOutpoint,
            address_outpoint_key(&output.script_hash, &output.outpoint),
        );
    }

    /// Unspent outputs of one address, ordered by outpoint.
    pub fn for_address(&self, script_hash: &Hash256) -> Result<Vec<TrackedOutput>, StoreError> {
        let mut outpoints = Vec::new();
        self.store.for_each_prefix(
            Column::AddressOutpoint,
            script_hash,
            &mut |key: &[u8], _value: &[u8]| {
                let outpoint = key
                    .get(32..)
                    .and_then(OutPoint::from_key)
                    .ok_or_else(|| StoreError::Backend("invalid address outpoint key".to_string()))?;
                outpoints.push(outpoint);
                Ok(())
            },
        )?;
        let mut outputs = Vec::with_capacity(outpoints.len());
        for outpoint in outpoints {
            let output = self.get(&outpoint)?.ok_or_else(|| {
                StoreError::Backend("address outpoint without utxo entry".to_string())
            })?;
            outputs.push(output);
        }
        Ok(outputs)
    }

    /// Every tracked unspent output.
    pub fn all(&self) -> Result<Vec<TrackedOutput>, StoreError> {
        let mut outputs = Vec::new();
        self.store
            .for_each_prefix(Column::Utxo, &[], &mut |_key: &[u8], value: &[u8]| {
                outputs.push(TrackedOutput::decode(value).map_err(|err| corrupt_record("utxo", err))?);
                Ok(())
            })?;
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use utxoscan_storage::memory::MemoryStore;

    fn output(tag: u8, script_hash: Hash256) -> TrackedOutput {
        TrackedOutput {
            outpoint: OutPoint {
                hash: [tag; 32],
                index: u32::from(tag),
            },
            script_hash,
            value: 1_000 * i64::from(tag),
            script_pubkey: vec![0x51, tag],
            height: u32::from(tag),
            tx_index: 0,
        }
    }

    #[test]
    fn address_lookup_follows_index() {
        let store = Arc::new(MemoryStore::new());
        let index = UtxoIndex::new(Arc::clone(&store));
        let mine = output(1, [0xaa; 32]);
        let other = output(2, [0xbb; 32]);
        let mut batch = WriteBatch::new();
        index.insert(&mut batch, &mine);
        index.insert(&mut batch, &other);
        store.write_batch(&batch).expect("write");

        assert_eq!(index.for_address(&[0xaa; 32]).expect("lookup"), vec![mine.clone()]);
        assert_eq!(index.all().expect("all").len(), 2);

        let mut batch = WriteBatch::new();
        index.remove(&mut batch, &mine);
        store.write_batch(&batch).expect("write");
        assert!(index.for_address(&[0xaa; 32]).expect("lookup").is_empty());
        assert_eq!(index.get(&mine.outpoint).expect("get"), None);
    }
}
