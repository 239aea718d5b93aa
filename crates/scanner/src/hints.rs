//! Transaction hints: txid to (height, tx index) of the block holding it.

use utxoscan_primitives::Hash256;
use utxoscan_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const TX_KEY_LEN: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TxKey {
    pub height: u32,
    pub tx_index: u32,
}

impl TxKey {
    pub fn encode(&self) -> [u8; TX_KEY_LEN] {
        let mut out = [0u8; TX_KEY_LEN];
        out[..4].copy_from_slice(&self.height.to_be_bytes());
        out[4..].copy_from_slice(&self.tx_index.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != TX_KEY_LEN {
            return None;
        }
        Some(Self {
            height: u32::from_be_bytes(bytes[..4].try_into().ok()?),
            tx_index: u32::from_be_bytes(bytes[4..].try_into().ok()?),
        })
    }
}

pub struct TxHintIndex<S> {
    store: S,
}

impl<S> TxHintIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> TxHintIndex<S> {
    pub fn insert(&self, batch: &mut WriteBatch, txid: &Hash256, key: TxKey) {
        batch.put(Column::TxHint, txid, key.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, txid: &Hash256) {
        batch.delete(Column::TxHint, txid);
    }

    pub fn get(&self, txid: &Hash256) -> Result<Option<TxKey>, StoreError> {
        let bytes = match self.store.get(Column::TxHint, txid)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        TxKey::decode(&bytes)
            .ok_or_else(|| StoreError::Backend("invalid tx hint entry".to_string()))
            .map(Some)
    }
}
